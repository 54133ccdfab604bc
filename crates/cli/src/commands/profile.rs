use std::path::Path;

use anyhow::{Context, Result};
use keytrace_core::profile::AnalysisProfile;

/// Load `--profile` when given, else the built-in tables.
pub fn load_profile(path: Option<&Path>) -> Result<AnalysisProfile> {
    match path {
        Some(path) => AnalysisProfile::from_path(path)
            .with_context(|| format!("Failed to load analysis profile: {}", path.display())),
        None => Ok(AnalysisProfile::default()),
    }
}

/// Render the default profile for editing.
pub fn render_default_profile(json: bool) -> Result<String> {
    let profile = AnalysisProfile::default();
    if json {
        serde_json::to_string_pretty(&profile).context("Failed to serialize profile to JSON")
    } else {
        profile.to_yaml().context("Failed to serialize profile to YAML")
    }
}

/// Print the default analysis profile.
pub fn print_profile_command(json: bool) -> Result<()> {
    println!("{}", render_default_profile(json)?);
    Ok(())
}
