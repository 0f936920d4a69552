//! Generates or rotates the `FullIdentity` that `server`/`client` load at startup,
//! writing it into the TOML file named by `identity_path` in `settings.toml`.

use protocol::identity::{FullIdentity, IdentitySnapshot};
use std::env;
use std::fs;
use std::path::Path;

fn is_running_in_docker() -> bool {
    Path::new("/.dockerenv").exists()
}

fn settings_path() -> &'static str {
    if is_running_in_docker() {
        "/app/settings.toml"
    } else {
        "./settings.toml"
    }
}

fn usage() -> ! {
    eprintln!("usage:");
    eprintln!("  config generate <name> <nick>");
    eprintln!("  config rotate-nick <nick>");
    std::process::exit(1);
}

fn load_identity(path: &str) -> Result<FullIdentity, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    let snapshot: IdentitySnapshot = toml::from_str(&content)?;
    Ok(FullIdentity::unmarshal(snapshot)?)
}

fn save_identity(identity: &FullIdentity, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let content = toml::to_string_pretty(&identity.marshal())?;
    fs::write(path, content)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = common::config::init(settings_path());
    let mut args = env::args().skip(1);
    let command = args.next().unwrap_or_else(|| usage());

    match command.as_str() {
        "generate" => {
            let name = args.next().unwrap_or_else(|| usage());
            let nick = args.next().unwrap_or_else(|| usage());
            if Path::new(&settings.identity_path).exists() {
                return Err(format!("identity already exists at {}; use rotate-nick instead", settings.identity_path).into());
            }
            let identity = FullIdentity::generate(name, nick);
            save_identity(&identity, &settings.identity_path)?;
            println!("generated identity {}", identity.public().fingerprint_hex());
        }
        "rotate-nick" => {
            let nick = args.next().unwrap_or_else(|| usage());
            let mut identity = load_identity(&settings.identity_path)?;
            identity.set_nick(nick);
            save_identity(&identity, &settings.identity_path)?;
            println!("identity {} renamed to {}", identity.public().fingerprint_hex(), identity.public().nick);
        }
        _ => usage(),
    }

    Ok(())
}
