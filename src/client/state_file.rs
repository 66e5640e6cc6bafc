use crate::client::errors::StateFileError;
use crate::properties;
use std::path::{Path, PathBuf};

const MEMBER_NAME_KEY: &str = "member-name";
const CLIENT_TYPE_KEY: &str = "client-type";
const GENERATION_KEY: &str = "generation";

fn state_file_path(directory: &Path, member_name: &str, client_type: &str) -> PathBuf {
    directory.join(format!("{}-frontend-{}.properties", member_name, client_type))
}

/// Returns this start's client generation and records it, so the next start gets a larger one.
/// A missing file means generation 0.
pub(crate) fn next_generation(
    logger: &slog::Logger,
    directory: &Path,
    member_name: &str,
    client_type: &str,
) -> Result<u64, StateFileError> {
    let path = state_file_path(directory, member_name, client_type);
    let generation = match properties::read_properties(&path)? {
        None => {
            slog::info!(logger, "No client state at {}, starting at generation 0", path.display());
            0
        }
        Some(stored) => {
            let found_member = stored.get(MEMBER_NAME_KEY).cloned().unwrap_or_default();
            let found_type = stored.get(CLIENT_TYPE_KEY).cloned().unwrap_or_default();
            if found_member != member_name || found_type != client_type {
                return Err(StateFileError::IdentityMismatch {
                    member: member_name.to_string(),
                    client_type: client_type.to_string(),
                    found_member,
                    found_type,
                });
            }

            let previous = stored
                .get(GENERATION_KEY)
                .ok_or_else(|| StateFileError::Corrupted(format!("{} has no {}", path.display(), GENERATION_KEY)))?
                .parse::<u64>()
                .map_err(|e| StateFileError::Corrupted(format!("bad {} in {}: {}", GENERATION_KEY, path.display(), e)))?;
            previous.checked_add(1).ok_or(StateFileError::GenerationExhausted)?
        }
    };

    std::fs::create_dir_all(directory)?;
    properties::write_properties_atomically(
        &path,
        &[
            (MEMBER_NAME_KEY, member_name.to_string()),
            (CLIENT_TYPE_KEY, client_type.to_string()),
            (GENERATION_KEY, generation.to_string()),
        ],
    )?;
    slog::info!(logger, "Client {}/{} is generation {}", member_name, client_type, generation);
    Ok(generation)
}
