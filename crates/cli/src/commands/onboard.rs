//! `spendgate onboard` — First-time setup.

use spendgate_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Spendgate — First-Time Setup");
    println!("============================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("Created config directory: {}", config_dir.display());
    } else {
        println!("Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\nConfig already exists at: {}", config_path.display());
        println!("Edit it manually or delete and re-run onboard.\n");
        return Ok(());
    }

    let default_toml = AppConfig::default_toml();
    std::fs::write(&config_path, &default_toml)?;
    println!("Created config.toml at: {}", config_path.display());
    println!("\nNext steps:");
    println!("  1. Add [[teams]] and [[keys]] budget policies to the config");
    println!("  2. Run: spendgate serve");
    println!("  3. Point your gateway's admission hooks at it\n");

    Ok(())
}
