//! Check command implementation for Lumen CLI.

use lumen_core::LumenConfig;

/// Print the effective configuration and where the interpreter resolves to.
pub fn execute(config: &LumenConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    println!("artifact dir: {}", config.artifact_dir().display());

    let interpreter = config.resolve_interpreter()?;
    println!("interpreter: {}", interpreter.display());
    Ok(())
}
