//! Resource display state derived from a strand

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::program::Program;
use crate::strand::Strand;

/// Coarse status of the resource a strand manages, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Creating,
    Running,
    Deleting,
}

impl ResourceState {
    /// Derive the state from the strand's position
    ///
    /// Deleting wins over everything once destroy is requested or the
    /// teardown label is reached; a steady label means running.
    pub fn derive(strand: &Strand, program: Option<&Program>, destroy_raised: bool) -> Self {
        let on_teardown = program
            .and_then(|p| p.teardown_label())
            .is_some_and(|label| label == strand.label);
        if destroy_raised || on_teardown {
            return Self::Deleting;
        }

        if program.is_some_and(|p| p.is_steady(&strand.label)) {
            Self::Running
        } else {
            Self::Creating
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
