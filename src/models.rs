// src/models.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// --- DEFINITION FILE MODELS (FOR TOML) ---
// These are what the user writes in `env_<stage>.toml`.

/// A whole definition file.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DefinitionFile {
    #[serde(default)]
    pub env: EnvSection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, VarDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, GroupDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, CommandDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, HookDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, ContextDecl>,
}

/// The `[env]` table: layer metadata.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_prepend: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boot_code: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose_run: Option<bool>,
}

/// A variable leaf. Every field is optional so that a child layer can
/// override only what it changes.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VarDecl {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_factory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setter: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupDecl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, VarDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, GroupDecl>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandDecl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default)]
    pub in_root: bool,
    #[serde(default = "default_true")]
    pub cd_back: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HookDecl {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ContextDecl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

// --- WATCH SPEC ---

/// What a watched root holds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    /// Definition layers: a change triggers a full rebuild.
    Definition,
    /// Script modules: a change triggers a partial reload.
    Sources,
}

/// A directory watched recursively, filtered by globs relative to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub kind: WatchKind,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

// --- USER SETTINGS (settings.toml) ---

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Settings {
    pub debounce_ms: u64,
    pub reload_timeout_secs: u64,
    pub shell: ShellSettings,
    pub glyphs: GlyphSettings,
}

/// The system shell used for non-command lines and `run` templates.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ShellSettings {
    pub path: PathBuf,
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GlyphSettings {
    pub loading: String,
    pub emergency: String,
    /// Per-stage overrides of the built-in stage glyphs.
    #[serde(default)]
    pub stages: BTreeMap<String, String>,
}

// --- INTROSPECTION (harness-only JSON state channel) ---

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct IntrospectionState {
    pub mode: String,
    pub env_name: String,
    pub stage: String,
    pub prompt: String,
    pub reload_count: u64,
    pub last_error: Option<String>,
    pub commands: Vec<String>,
    pub last_actions: Vec<String>,
}
