//! Human-readable frame log.
//!
//! Frames are written every `interval` steps; frames in which the oracle was
//! called are always written.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::{RunHeader, RunSummary, StepObserver, StepRecord};

const RULE: &str = "-------------------------------------------------------------------------------";

pub struct TextLog<W: Write = BufWriter<File>> {
    out: W,
    interval: usize,
}

impl TextLog {
    pub fn create(path: impl AsRef<Path>, interval: usize) -> std::io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?), interval))
    }
}

impl<W: Write> TextLog<W> {
    pub fn new(out: W, interval: usize) -> Self {
        Self {
            out,
            interval: interval.max(1),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn should_write(&self, record: &StepRecord) -> bool {
        !record.is_quiet() || record.step_index % self.interval == 0
    }
}

fn write_named(out: &mut impl Write, values: &[(String, f64)]) -> std::io::Result<()> {
    for (label, value) in values {
        writeln!(out, "  {label}: {value:.6}")?;
    }
    Ok(())
}

impl<W: Write> StepObserver for TextLog<W> {
    fn on_start(&mut self, header: &RunHeader) -> std::io::Result<()> {
        let out = &mut self.out;
        writeln!(out, "{RULE}")?;
        writeln!(out, "On-the-fly MD run {}", header.run_id)?;
        writeln!(out, "Started: {}", header.started_at.to_rfc3339())?;
        writeln!(out, "{RULE}")?;
        writeln!(out, "Atoms: {}", header.n_atoms)?;
        writeln!(out, "Species: {}", header.species.join(" "))?;
        writeln!(out, "Cell:")?;
        for row in &header.cell {
            writeln!(out, "  {:>12.6} {:>12.6} {:>12.6}", row[0], row[1], row[2])?;
        }
        writeln!(out, "Kernel: {}", header.kernel.as_str())?;
        match header.cutoffs.three_body {
            Some(c3) => writeln!(out, "Cutoffs: 2-body {:.4}, 3-body {c3:.4}", header.cutoffs.two_body)?,
            None => writeln!(out, "Cutoffs: 2-body {:.4}", header.cutoffs.two_body)?,
        }
        writeln!(out, "Initial hyperparameters:")?;
        write_named(out, &header.hyperparameters)?;
        writeln!(out, "Uncertainty tolerance factor: {}", header.tolerance_factor)?;
        writeln!(out, "Max atoms added per trigger: {}", header.max_atoms_added)?;
        match header.freeze_hyps {
            Some(step) => writeln!(out, "Hyperparameters frozen from step {step}")?,
            None => writeln!(out, "Hyperparameters never frozen")?,
        }
        writeln!(out, "Time step: {}", header.time_step)?;
        writeln!(out, "Steps: {}", header.steps)?;
        writeln!(out, "Oracle: {}", header.oracle)?;
        writeln!(out, "Mapping: {}", if header.mapping_enabled { "enabled" } else { "disabled" })?;
        writeln!(out, "{RULE}")?;
        out.flush()
    }

    fn on_step(&mut self, record: &StepRecord) -> std::io::Result<()> {
        if !self.should_write(record) {
            return Ok(());
        }
        let out = &mut self.out;
        writeln!(out, "{RULE}")?;
        if record.is_quiet() {
            writeln!(
                out,
                "Step {} | t = {:.6} | forces: {}",
                record.step_index,
                record.time,
                record.source.as_str()
            )?;
        } else {
            writeln!(
                out,
                "Step {} | t = {:.6} | forces: {} | oracle called on atoms {:?}",
                record.step_index,
                record.time,
                record.source.as_str(),
                record.selected
            )?;
        }
        if record.mapping_fallback {
            writeln!(out, "Mapping out of domain; surrogate forces used")?;
        }
        writeln!(
            out,
            "{:<6} {:>36} {:>36} {:>36} {:>10}",
            "El", "Position (x, y, z)", "Force (x, y, z)", "Std (x, y, z)", "Uncert."
        )?;
        for label in record.labels() {
            let i = label.atom_index;
            let p = record.positions[i];
            let f = label.force;
            let s = record.stds[i];
            writeln!(
                out,
                "{:<6} {:>12.6}{:>12.6}{:>12.6} {:>12.6}{:>12.6}{:>12.6} {:>12.6}{:>12.6}{:>12.6} {:>10.6}",
                record.species[i],
                p[0],
                p[1],
                p[2],
                f[0],
                f[1],
                f[2],
                s[0],
                s[1],
                s[2],
                record.uncertainties.get(i).copied().unwrap_or(0.0)
            )?;
        }
        writeln!(out, "Threshold: {:.6}", record.threshold)?;
        if let Some(e) = record.oracle_energy {
            writeln!(out, "Oracle energy: {e:.6}")?;
        }
        if let Some(hyps) = &record.hyperparameters {
            writeln!(out, "Hyperparameters{}:", if record.optimized { " (optimized)" } else { "" })?;
            write_named(out, hyps)?;
        }
        writeln!(out, "Active set size: {}", record.active_set_size)?;
        out.flush()
    }

    fn on_finish(&mut self, summary: &RunSummary) -> std::io::Result<()> {
        let out = &mut self.out;
        writeln!(out, "{RULE}")?;
        writeln!(out, "Run complete: {}", summary.finished_at.to_rfc3339())?;
        writeln!(out, "Steps: {}", summary.steps)?;
        writeln!(out, "Triggering steps: {}", summary.triggers)?;
        writeln!(out, "Oracle calls: {}", summary.oracle_calls)?;
        writeln!(out, "Active set size: {}", summary.active_set_size)?;
        writeln!(out, "Final hyperparameters:")?;
        write_named(out, &summary.hyperparameters)?;
        writeln!(out, "Wall time: {:.2} s", summary.wall_seconds)?;
        out.flush()
    }
}
