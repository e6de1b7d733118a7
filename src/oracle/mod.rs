//! Ground-truth force calculators.
//!
//! Every calculator implements the [`Oracle`] trait so the loop controller
//! can label frames uniformly.
//!
//! Included calculators:
//! - **Command** ([`command`]) -- an external program fed JSON on stdin.
//! - **HTTP** ([`http`]) -- a remote service reached by `POST /evaluate`.
//! - **Lennard-Jones** ([`lennard_jones`]) -- analytic pair potential used as
//!   reference ground truth.

pub mod command;
pub mod http;
pub mod lennard_jones;
pub mod traits;

use serde::{Deserialize, Serialize};

pub use command::{CommandOracle, CommandOracleConfig};
pub use http::{HttpOracle, HttpOracleConfig};
pub use lennard_jones::{LennardJones, LennardJonesConfig};
pub use traits::{timeout_from_secs, Oracle, OracleOutput, OracleRequest};

use crate::error::OracleError;
use crate::structure::Configuration;

/// Oracle selection as written in the run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleConfig {
    Command(CommandOracleConfig),
    Http(HttpOracleConfig),
    LennardJones(LennardJonesConfig),
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self::LennardJones(LennardJonesConfig::default())
    }
}

// ---------------------------------------------------------------------------
// AnyOracle: enum dispatch wrapper for configuration-time selection
// ---------------------------------------------------------------------------

/// An enum wrapper around all concrete oracle types, enabling runtime
/// selection without `dyn` (which is incompatible with async trait methods).
pub enum AnyOracle {
    Command(CommandOracle),
    Http(HttpOracle),
    LennardJones(LennardJones),
}

impl AnyOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        Ok(match config {
            OracleConfig::Command(c) => Self::Command(CommandOracle::new(c.clone())?),
            OracleConfig::Http(c) => Self::Http(HttpOracle::new(c.clone())?),
            OracleConfig::LennardJones(c) => Self::LennardJones(LennardJones::new(c.clone())),
        })
    }
}

impl Oracle for AnyOracle {
    async fn evaluate(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError> {
        match self {
            Self::Command(o) => o.evaluate(configuration).await,
            Self::Http(o) => o.evaluate(configuration).await,
            Self::LennardJones(o) => o.evaluate(configuration).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Command(o) => o.name(),
            Self::Http(o) => o.name(),
            Self::LennardJones(o) => o.name(),
        }
    }
}
