//! Config and program files
//!
//! Reads and writes engine configuration and compiled programs as JSON.
//! Writes go through a temp file and a rename so a crash never leaves a
//! half-written file behind.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use anyhow::{Context, Result};

use super::EngineConfig;
use super::node::Program;

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

    file.write_all(data)
        .context("Failed to write data")?;

    file.sync_all()
        .context("Failed to sync file")?;

    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    // Sync parent directory
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;

        dir.sync_all()
            .context("Failed to sync directory")?;
    }

    Ok(())
}

/// Read a file
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .with_context(|| format!("Failed to read file: {:?}", path))
}

/// Write engine configuration
pub fn write_config(path: &Path, config: &EngineConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config)
        .context("Failed to serialize config")?;

    write_atomic(path, &json)
}

/// Load engine configuration
///
/// Missing fields take their default values.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let data = read_file(path)?;
    let config: EngineConfig = serde_json::from_slice(&data)
        .context("Failed to deserialize config")?;

    config.validate()
        .with_context(|| format!("Invalid config in {:?}", path))?;

    Ok(config)
}

/// Write a compiled program
pub fn write_program(path: &Path, program: &Program) -> Result<()> {
    let json = serde_json::to_vec_pretty(program)
        .context("Failed to serialize program")?;

    write_atomic(path, &json)
}

/// Load and validate a compiled program
pub fn load_program(path: &Path) -> Result<Program> {
    let data = read_file(path)?;
    let text = std::str::from_utf8(&data)
        .with_context(|| format!("Program file is not UTF-8: {:?}", path))?;

    let program = Program::from_json(text)
        .with_context(|| format!("Failed to load program from {:?}", path))?;

    Ok(program)
}
