//! Machine-readable log: one tagged JSON object per line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use super::{RunHeader, RunSummary, StepObserver, StepRecord};

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    Start(&'a RunHeader),
    Step(&'a StepRecord),
    Finish(&'a RunSummary),
}

pub struct JsonlLog<W: Write = BufWriter<File>> {
    out: W,
}

impl JsonlLog {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonlLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &Line<'_>) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl<W: Write> StepObserver for JsonlLog<W> {
    fn on_start(&mut self, header: &RunHeader) -> std::io::Result<()> {
        self.write_line(&Line::Start(header))
    }

    fn on_step(&mut self, record: &StepRecord) -> std::io::Result<()> {
        self.write_line(&Line::Step(record))
    }

    fn on_finish(&mut self, summary: &RunSummary) -> std::io::Result<()> {
        self.write_line(&Line::Finish(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::fixtures;

    #[test]
    fn test_one_tagged_object_per_line() {
        let mut log = JsonlLog::new(Vec::new());
        log.on_start(&fixtures::header()).unwrap();
        log.on_step(&fixtures::record(0, vec![1])).unwrap();
        log.on_finish(&fixtures::summary()).unwrap();
        let text = String::from_utf8(log.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "start");
        assert_eq!(lines[1]["event"], "step");
        assert_eq!(lines[1]["selected"][0], 1);
        assert_eq!(lines[1]["source"], "surrogate");
        assert_eq!(lines[2]["event"], "finish");
    }

    #[test]
    fn test_step_lines_parse_back_into_records() {
        let mut log = JsonlLog::new(Vec::new());
        let record = fixtures::record(2, vec![]);
        log.on_step(&record).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&log.into_inner()).unwrap();
        value.as_object_mut().unwrap().remove("event");
        let parsed: StepRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }
}
