//! `metachat init`: write a starter config.

use crate::config::write_starter_config;
use metachat_types::error::MetachatResult;
use std::path::Path;

pub fn cmd_init(path: &Path) -> MetachatResult<()> {
    write_starter_config(path)?;
    println!("Wrote starter config to {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Uncomment the backend sections you use and export their secrets");
    println!("  2. Add rooms (send \"metachat chatID\" in a chat to learn its id)");
    println!("  3. metachat check --config {}", path.display());
    println!("  4. metachat start --config {}", path.display());
    Ok(())
}
