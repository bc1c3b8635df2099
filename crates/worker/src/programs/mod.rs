//! Programs shipped with the worker

pub mod example;
pub mod fanout;

use strand_engine::program::{ProgramRegistry, RegistryError};

/// Registry with every built-in program
pub fn registry() -> Result<ProgramRegistry, RegistryError> {
    ProgramRegistry::new()
        .with(example::program()?)?
        .with(fanout::program()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let registry = registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(example::NAME));
        assert!(registry.contains(fanout::NAME));
        assert_eq!(
            registry.get(fanout::NAME).unwrap().teardown_label(),
            Some("destroy")
        );
    }
}
