use crate::config::Config;
use crate::container::Container;
use crate::cryptography::{parse_key_hex, CipherAlgorithm};
use crate::error::{Error, Result};
use crate::keystore;

use super::prompt_passphrase;

/// Create the retention record that all later runs verify against, plus
/// an empty encrypted container for the file browser to grow.
pub fn run(config: Config, algorithm: CipherAlgorithm, iterations: u32) -> Result<()> {
    let key_path = config.key_path();
    if key_path.exists() {
        return Err(Error::Configuration(format!(
            "retention record already exists at {}",
            key_path.display()
        )));
    }
    std::fs::create_dir_all(&config.data_dir)?;

    let passphrase = prompt_passphrase("New vault passphrase")?;
    let confirm = prompt_passphrase("Repeat passphrase")?;
    if passphrase != confirm {
        return Err(Error::Configuration("passphrases do not match".to_string()));
    }

    keystore::generate_retention(&key_path, &passphrase, iterations, algorithm)?;
    println!("retention record written to {}", key_path.display());

    // Prove the record round-trips before the user relies on it.
    let key_hex = keystore::verify_passphrase(&key_path, &passphrase)?;
    let key = parse_key_hex(&key_hex)?;

    let container_path = config.container_path();
    if !container_path.exists() {
        Container::new().save_encrypted(&container_path, &key, algorithm)?;
        println!("empty container created at {}", container_path.display());
    }
    println!("vault is ready");
    Ok(())
}
