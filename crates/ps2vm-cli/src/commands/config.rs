//! `ps2vm config`: print or write the effective configuration.

use anyhow::Context;
use ps2vm_core::VmConfig;
use std::path::Path;

pub fn execute(config: &VmConfig, write: Option<&Path>) -> anyhow::Result<()> {
    match write {
        Some(path) => {
            config
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ps2vm.toml");
        let mut config = VmConfig::default();
        config.gs.close_on_popup = true;

        execute(&config, Some(&path)).unwrap();
        assert_eq!(VmConfig::load(&path).unwrap(), config);
    }
}
