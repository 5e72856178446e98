//! System prompt assembly.
//!
//! Every conversation starts from a base prompt (file on disk or configured
//! default) stamped with the current local date and time. Voice sessions
//! additionally carry the optional voice style hint.

use crate::config::PromptConfig;
use chrono::Local;
use std::fs;
use tracing::{debug, info};

/// Base prompt: the prompt file when it exists and is non-blank, otherwise the configured default.
pub fn load_base_prompt(config: &PromptConfig) -> String {
    match fs::read_to_string(&config.system_prompt_path) {
        Ok(contents) if !contents.trim().is_empty() => {
            info!("Loaded system prompt from {}", config.system_prompt_path);
            contents.trim().to_string()
        }
        Ok(_) => {
            debug!("System prompt file {} is blank, using default", config.system_prompt_path);
            config.system_prompt.clone()
        }
        Err(err) => {
            debug!("No system prompt file at {}: {}", config.system_prompt_path, err);
            config.system_prompt.clone()
        }
    }
}

fn current_time_string() -> String {
    Local::now().format("%A, %B %-d, %Y at %-I:%M:%S %p %Z").to_string()
}

/// The bare "current date and time" sentence.
pub fn current_time_message() -> String {
    format!("The current date and time is {}.", current_time_string())
}

pub fn with_current_time(base: &str) -> String {
    format!("{}\n\n{}", base, current_time_message())
}

/// Instructions sent upstream in `session.update`.
pub fn voice_instructions(base: &str, voice_style: &str) -> String {
    let style = voice_style.trim();
    if style.is_empty() {
        base.to_string()
    } else {
        format!("{}\n\nVoice style: {}", base, style)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_prompt_file_falls_back_to_default() {
        let config = PromptConfig {
            system_prompt: "Be brief.".to_string(),
            system_prompt_path: "/definitely/not/here/system-prompt.txt".to_string(),
        };
        assert_eq!(load_base_prompt(&config), "Be brief.");
    }

    #[test]
    fn test_prompt_file_is_trimmed() {
        let path = std::env::temp_dir().join(format!("vox-relay-prompt-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, "  Speak like a pirate.\n\n").unwrap();

        let config = PromptConfig {
            system_prompt: "Be brief.".to_string(),
            system_prompt_path: path.to_string_lossy().to_string(),
        };
        assert_eq!(load_base_prompt(&config), "Speak like a pirate.");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_with_current_time_keeps_base_first() {
        let prompt = with_current_time("Be brief.");
        assert!(prompt.starts_with("Be brief.\n\nThe current date and time is "));
        assert!(prompt.ends_with('.'));
    }

    #[test]
    fn test_voice_style_is_optional() {
        assert_eq!(voice_instructions("Be brief.", "  "), "Be brief.");
        assert_eq!(
            voice_instructions("Be brief.", "warm and upbeat"),
            "Be brief.\n\nVoice style: warm and upbeat"
        );
    }
}
