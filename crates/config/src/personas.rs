//! Persona registry
//!
//! Binds wake-word model identifiers to persona descriptors (synthesis
//! voice, display name, reasoning prompt). The table is loaded from
//! YAML once at startup, validated, and never mutated afterwards: the
//! orchestrator only reads it.
//!
//! Validation happens entirely at load time: voice ids must belong to
//! the closed set of synthesis voices, and prompt paths must resolve
//! inside the trusted prompt directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component as PathComponent, Path, PathBuf};

use crate::ConfigError;

/// Closed set of synthesis voices the channel backend accepts
pub const VALID_VOICES: &[&str] = &[
    "alloy", "ash", "ballad", "coral", "echo", "sage", "shimmer", "verse",
];

/// Immutable persona descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonaDescriptor {
    /// Stable persona name (registry key for the default lookup)
    pub name: String,
    /// Wake-word model that activates this persona
    pub wake_word_model_id: String,
    /// Synthesis voice; must be in [`VALID_VOICES`]
    pub voice_id: String,
    /// Name spoken/shown to the user
    pub display_name: String,
    /// Prompt file, relative to the trusted prompt directory
    pub prompt_path: PathBuf,
    /// Free-form personality traits surfaced to the reasoning backend
    #[serde(default)]
    pub traits: Vec<String>,
}

/// On-disk persona table shape
#[derive(Debug, Deserialize)]
struct PersonaTable {
    personas: Vec<PersonaDescriptor>,
}

/// Static lookup from wake-word identifiers to persona descriptors
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    by_wake_word: HashMap<String, PersonaDescriptor>,
    by_name: HashMap<String, PersonaDescriptor>,
    prompt_dir: PathBuf,
}

impl PersonaRegistry {
    /// Load and validate the registry from a YAML table
    pub fn load(
        table_path: impl AsRef<Path>,
        prompt_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let table_path = table_path.as_ref();
        let content = std::fs::read_to_string(table_path)
            .map_err(|_| ConfigError::FileNotFound(table_path.display().to_string()))?;

        let table: PersonaTable =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Self::from_descriptors(table.personas, prompt_dir)
    }

    /// Build from already-parsed descriptors (used by tests and
    /// embedders that assemble the table programmatically)
    pub fn from_descriptors(
        personas: Vec<PersonaDescriptor>,
        prompt_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let prompt_dir = prompt_dir.into();

        if personas.is_empty() {
            return Err(ConfigError::MissingField("personas".to_string()));
        }

        let mut by_wake_word = HashMap::new();
        let mut by_name = HashMap::new();

        for persona in personas {
            validate_voice(&persona)?;
            validate_prompt_path(&prompt_dir, &persona)?;

            if by_wake_word
                .insert(persona.wake_word_model_id.clone(), persona.clone())
                .is_some()
            {
                return Err(ConfigError::InvalidValue {
                    field: "personas".to_string(),
                    message: format!(
                        "Duplicate wake word model '{}'",
                        persona.wake_word_model_id
                    ),
                });
            }
            by_name.insert(persona.name.clone(), persona);
        }

        Ok(Self {
            by_wake_word,
            by_name,
            prompt_dir,
        })
    }

    /// Look up the persona bound to a wake-word model id
    pub fn get(&self, wake_word_model_id: &str) -> Option<&PersonaDescriptor> {
        self.by_wake_word.get(wake_word_model_id)
    }

    /// Look up a persona by its stable name
    pub fn get_by_name(&self, name: &str) -> Option<&PersonaDescriptor> {
        self.by_name.get(name)
    }

    /// Read a persona's prompt text from the trusted directory
    pub fn load_prompt(&self, persona: &PersonaDescriptor) -> Result<String, ConfigError> {
        let path = self.prompt_dir.join(&persona.prompt_path);
        std::fs::read_to_string(&path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_wake_word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_wake_word.is_empty()
    }
}

fn validate_voice(persona: &PersonaDescriptor) -> Result<(), ConfigError> {
    if !VALID_VOICES.contains(&persona.voice_id.as_str()) {
        return Err(ConfigError::UnknownVoice {
            persona: persona.name.clone(),
            voice: persona.voice_id.clone(),
        });
    }
    Ok(())
}

/// Reject prompt paths that could escape the trusted directory. The
/// check is component-wise so it holds even when the file does not
/// exist yet at validation time.
fn validate_prompt_path(prompt_dir: &Path, persona: &PersonaDescriptor) -> Result<(), ConfigError> {
    let path = &persona.prompt_path;

    let escapes = path.components().any(|c| {
        matches!(
            c,
            PathComponent::ParentDir | PathComponent::RootDir | PathComponent::Prefix(_)
        )
    });

    if escapes || path.as_os_str().is_empty() {
        return Err(ConfigError::UnsafePromptPath {
            persona: persona.name.clone(),
            path: path.display().to_string(),
        });
    }

    let resolved = prompt_dir.join(path);
    if !resolved.is_file() {
        return Err(ConfigError::FileNotFound(resolved.display().to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn persona(name: &str, wake: &str, voice: &str, prompt: &str) -> PersonaDescriptor {
        PersonaDescriptor {
            name: name.to_string(),
            wake_word_model_id: wake.to_string(),
            voice_id: voice.to_string(),
            display_name: name.to_string(),
            prompt_path: PathBuf::from(prompt),
            traits: vec![],
        }
    }

    fn prompt_dir_with(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in files {
            fs::write(dir.path().join(file), "You are a helpful companion.").unwrap();
        }
        dir
    }

    #[test]
    fn test_registry_lookup_by_wake_word() {
        let dir = prompt_dir_with(&["luna.md", "rex.md"]);
        let registry = PersonaRegistry::from_descriptors(
            vec![
                persona("luna", "hey_luna", "coral", "luna.md"),
                persona("rex", "hey_rex", "ash", "rex.md"),
            ],
            dir.path(),
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("hey_luna").unwrap().voice_id, "coral");
        assert_eq!(registry.get_by_name("rex").unwrap().wake_word_model_id, "hey_rex");
        assert!(registry.get("hey_nobody").is_none());
    }

    #[test]
    fn test_unknown_voice_rejected() {
        let dir = prompt_dir_with(&["luna.md"]);
        let err = PersonaRegistry::from_descriptors(
            vec![persona("luna", "hey_luna", "gravel", "luna.md")],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVoice { .. }));
    }

    #[test]
    fn test_prompt_traversal_rejected() {
        let dir = prompt_dir_with(&["luna.md"]);
        let err = PersonaRegistry::from_descriptors(
            vec![persona("luna", "hey_luna", "coral", "../../etc/passwd")],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsafePromptPath { .. }));
    }

    #[test]
    fn test_absolute_prompt_path_rejected() {
        let dir = prompt_dir_with(&["luna.md"]);
        let err = PersonaRegistry::from_descriptors(
            vec![persona("luna", "hey_luna", "coral", "/etc/passwd")],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsafePromptPath { .. }));
    }

    #[test]
    fn test_missing_prompt_file_rejected() {
        let dir = prompt_dir_with(&[]);
        let err = PersonaRegistry::from_descriptors(
            vec![persona("luna", "hey_luna", "coral", "luna.md")],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_duplicate_wake_word_rejected() {
        let dir = prompt_dir_with(&["a.md", "b.md"]);
        let err = PersonaRegistry::from_descriptors(
            vec![
                persona("a", "hey_you", "coral", "a.md"),
                persona("b", "hey_you", "ash", "b.md"),
            ],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_empty_table_rejected() {
        let dir = prompt_dir_with(&[]);
        let err = PersonaRegistry::from_descriptors(vec![], dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn test_load_prompt() {
        let dir = prompt_dir_with(&["luna.md"]);
        let registry = PersonaRegistry::from_descriptors(
            vec![persona("luna", "hey_luna", "coral", "luna.md")],
            dir.path(),
        )
        .unwrap();
        let prompt = registry
            .load_prompt(registry.get("hey_luna").unwrap())
            .unwrap();
        assert!(prompt.contains("companion"));
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = prompt_dir_with(&["luna.md"]);
        let table = dir.path().join("personas.yaml");
        fs::write(
            &table,
            r#"
personas:
  - name: luna
    wake_word_model_id: hey_luna
    voice_id: coral
    display_name: Luna
    prompt_path: luna.md
    traits: [cheerful, curious]
"#,
        )
        .unwrap();

        let registry = PersonaRegistry::load(&table, dir.path()).unwrap();
        let luna = registry.get("hey_luna").unwrap();
        assert_eq!(luna.display_name, "Luna");
        assert_eq!(luna.traits, vec!["cheerful", "curious"]);
    }
}
