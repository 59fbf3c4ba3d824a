//! Rule-based access control
//!
//! Rules are evaluated in declaration order and the last matching rule wins
//! for every bit it touches. There is no notion of "most specific" rule.

use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::VirtualPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Allow,
    Deny,
}

impl Permission {
    fn allowed(self) -> bool {
        self == Permission::Allow
    }
}

/// One access rule. Unset bits default to `Allow`, exactly like a rule that
/// spells them out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessRule {
    /// Pattern such as `/docs/*`, `/docs/*.*`, `/docs/*.pdf`, `/docs/report.*`
    /// or an exact path.
    pub path: String,
    pub is_file: bool,
    pub role: Option<String>,
    pub read: Permission,
    pub write: Permission,
    pub write_contents: Permission,
    pub copy: Permission,
    pub download: Permission,
    pub upload: Permission,
    pub message: Option<String>,
}

/// Active role plus the ordered rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessDetails {
    pub role: Option<String>,
    pub rules: Vec<AccessRule>,
}

/// Resolved permission for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPermission {
    pub copy: bool,
    pub download: bool,
    pub write: bool,
    pub write_contents: bool,
    pub read: bool,
    pub upload: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Default for AccessPermission {
    fn default() -> Self {
        Self {
            copy: true,
            download: true,
            write: true,
            write_contents: true,
            read: true,
            upload: true,
            message: String::new(),
        }
    }
}

impl AccessPermission {
    pub fn allows(&self, action: PermissionAction) -> bool {
        match action {
            PermissionAction::Read => self.read,
            PermissionAction::Write => self.write,
            PermissionAction::WriteContents => self.write_contents,
            PermissionAction::Copy => self.copy,
            PermissionAction::Download => self.download,
            PermissionAction::Upload => self.upload,
        }
    }

    fn apply_all(&mut self, rule: &AccessRule) {
        self.read = rule.read.allowed();
        self.write = rule.write.allowed();
        self.write_contents = rule.write_contents.allowed();
        self.copy = rule.copy.allowed();
        self.download = rule.download.allowed();
        self.upload = rule.upload.allowed();
        self.message = rule.message.clone().unwrap_or_default();
    }

    fn apply_file(&mut self, rule: &AccessRule) {
        self.read = rule.read.allowed();
        self.write = rule.write.allowed();
        self.copy = rule.copy.allowed();
        self.download = rule.download.allowed();
        self.message = rule.message.clone().unwrap_or_default();
    }

    fn inherit(&mut self, rule: &AccessRule) {
        self.write = rule.write.allowed();
        self.write_contents = rule.write_contents.allowed();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAction {
    Read,
    Write,
    WriteContents,
    Copy,
    Download,
    Upload,
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionAction::Read => "read",
            PermissionAction::Write => "write",
            PermissionAction::WriteContents => "writeContents",
            PermissionAction::Copy => "copy",
            PermissionAction::Download => "download",
            PermissionAction::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AccessDenied {
    pub message: String,
}

/// How a rule's last path segment reads.
enum RulePattern<'a> {
    /// `dir/*` for folders, `dir/*.*` for files.
    Any,
    Extension(&'a str),
    Stem(&'a str),
    Exact,
}

struct ParsedRule<'a> {
    /// Normalized full path, `/a/b` or `/`.
    full: String,
    /// Directory the pattern applies in, with trailing `/`.
    dir: String,
    pattern: RulePattern<'a>,
}

fn parse_rule(rule: &AccessRule) -> ParsedRule<'_> {
    let trimmed = rule.path.trim_matches('/');
    let full = format!("/{}", trimmed);
    let (parent, last) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    let parent_dir = if parent.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", parent)
    };

    let pattern = if last == "*" || last == "*.*" {
        RulePattern::Any
    } else if let Some(ext) = last.strip_prefix("*.") {
        RulePattern::Extension(ext)
    } else if let Some(stem) = last.strip_suffix(".*") {
        RulePattern::Stem(stem)
    } else {
        RulePattern::Exact
    };

    let dir = match pattern {
        RulePattern::Exact if trimmed.is_empty() => "/".to_string(),
        RulePattern::Exact => format!("{}/", full),
        _ => parent_dir,
    };
    ParsedRule { full, dir, pattern }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

/// Evaluates [`AccessDetails`] against virtual paths.
#[derive(Debug, Clone, Default)]
pub struct PermissionEngine {
    details: Option<Arc<AccessDetails>>,
}

impl PermissionEngine {
    pub fn new(details: Option<AccessDetails>) -> Self {
        Self { details: details.map(Arc::new) }
    }

    pub fn is_configured(&self) -> bool {
        self.details.is_some()
    }

    /// Effective permission for `target`, `None` when no rules are configured.
    pub fn permission_for(&self, target: &VirtualPath, is_file: bool) -> Option<AccessPermission> {
        let details = self.details.as_ref()?;
        let mut permission = AccessPermission::default();

        let applicable = details.rules.iter().filter(|rule| match &rule.role {
            None => true,
            Some(role) => details.role.as_deref() == Some(role.as_str()),
        });

        if is_file {
            let parent = target.parent().unwrap_or_default().as_dir_string();
            let name = target.name().unwrap_or_default();
            let full = target.to_string();
            let (stem, ext) = split_extension(name);

            for rule in applicable {
                let parsed = parse_rule(rule);
                if rule.is_file {
                    let matched = match parsed.pattern {
                        RulePattern::Any => parent.starts_with(&parsed.dir),
                        RulePattern::Extension(rule_ext) => {
                            parent == parsed.dir && ext.eq_ignore_ascii_case(rule_ext)
                        }
                        RulePattern::Stem(rule_stem) => parent == parsed.dir && stem == rule_stem,
                        RulePattern::Exact => full == parsed.full,
                    };
                    if matched {
                        permission.apply_file(rule);
                    }
                } else if parent.starts_with(&parsed.dir) {
                    permission.inherit(rule);
                }
            }
        } else {
            let full = target.to_string();
            let dir = target.as_dir_string();

            for rule in applicable.filter(|rule| !rule.is_file) {
                let parsed = parse_rule(rule);
                match parsed.pattern {
                    RulePattern::Any => {
                        if dir.starts_with(&parsed.dir) && dir.len() > parsed.dir.len() {
                            permission.apply_all(rule);
                        }
                    }
                    _ => {
                        if full == parsed.full {
                            permission.apply_all(rule);
                        } else if dir.starts_with(&parsed.dir) {
                            permission.inherit(rule);
                        }
                    }
                }
            }
        }
        Some(permission)
    }

    /// Fail with an [`AccessDenied`] unless every action is allowed on `target`.
    pub fn require(
        &self,
        target: &VirtualPath,
        is_file: bool,
        actions: &[PermissionAction],
    ) -> Result<(), AccessDenied> {
        let Some(permission) = self.permission_for(target, is_file) else {
            return Ok(());
        };
        match actions.iter().find(|action| !permission.allows(**action)) {
            None => Ok(()),
            Some(action) => {
                let name = target.name().map(str::to_string).unwrap_or_else(|| target.to_string());
                tracing::warn!("Denied {} on '{}'", action, target);
                Err(denial(&permission, &name, *action))
            }
        }
    }

    /// Whether every folder from the root down to `target` grants read.
    pub fn chain_readable(&self, target: &VirtualPath) -> bool {
        if !self.is_configured() {
            return true;
        }
        target
            .ancestors()
            .iter()
            .all(|folder| self.permission_for(folder, false).map_or(true, |p| p.read))
    }
}

/// Denial for a failed `action` on an item named `name`.
pub fn denial(permission: &AccessPermission, name: &str, action: PermissionAction) -> AccessDenied {
    let message = if permission.message.is_empty() {
        format!(
            "'{}' is not accessible. You need permission to perform the {} action.",
            name, action
        )
    } else {
        permission.message.clone()
    };
    AccessDenied { message }
}
