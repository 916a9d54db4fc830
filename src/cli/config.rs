use std::path::Path;

use anyhow::Result;
use clap::Args;

use crate::config::Config;

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    /// Print only the path the configuration was looked up at
    #[arg(long)]
    pub path: bool,
}

pub fn render_config(config: &Config) -> Result<String> {
    config.validate()?;
    Ok(serde_yaml::to_string(config)?)
}

pub fn cmd_config(args: ConfigArgs, config: &Config, path: &Path) -> Result<()> {
    if args.path {
        println!("{}", path.display());
        return Ok(());
    }
    println!("# effective configuration ({})", path.display());
    print!("{}", render_config(config)?);
    Ok(())
}
