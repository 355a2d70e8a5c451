use anyhow::{bail, Result};
use std::path::Path;

use crate::config::FleetKernelConfig;

pub enum ConfigCommand {
    Show,
    Init { path: String, force: bool },
}

impl ConfigCommand {
    pub fn execute(&self, config: &FleetKernelConfig) -> Result<()> {
        match self {
            ConfigCommand::Show => {
                print!("{}", render(config)?);
                Ok(())
            }
            ConfigCommand::Init { path, force } => write_default(Path::new(path), *force),
        }
    }
}

pub fn render(config: &FleetKernelConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

fn write_default(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        );
    }
    FleetKernelConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet-kernel.toml");
        std::fs::write(&path, "# existing\n").unwrap();

        let config = FleetKernelConfig::default();
        let keep = ConfigCommand::Init {
            path: path.display().to_string(),
            force: false,
        };
        assert!(keep.execute(&config).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# existing\n");

        let overwrite = ConfigCommand::Init {
            path: path.display().to_string(),
            force: true,
        };
        overwrite.execute(&config).unwrap();
        assert_eq!(FleetKernelConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn render_includes_every_section() {
        let rendered = render(&FleetKernelConfig::default()).unwrap();
        for section in ["[kernel]", "[locks]", "[commands]", "[health]", "[scaling]"] {
            assert!(rendered.contains(section), "missing {section}");
        }
    }
}
