use std::{collections::HashSet, fmt::Display};

/// Structural role of a module in the model graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Linear,
    Embedding,
    LmHead,
    Norm,
    VisionTower,
    Projector,
}

/// Ownership path of a module, root first. Displays as the dotted parameter prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ModulePath(Vec<String>);

impl ModulePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn join(&self, segment: impl ToString) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Dotted name of a parameter owned by this module.
    pub fn param(&self, name: &str) -> String {
        if self.0.is_empty() {
            name.to_string()
        } else {
            format!("{self}.{name}")
        }
    }
}

impl From<&str> for ModulePath {
    fn from(value: &str) -> Self {
        Self(
            value
                .split('.')
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
        )
    }
}

impl Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Which linear layers receive adapters.
///
/// A module is adapted when it is a [`ModuleKind::Linear`] and none of its path
/// segments is excluded.
#[derive(Debug, Clone)]
pub struct TargetModules {
    excluded: HashSet<String>,
}

impl Default for TargetModules {
    fn default() -> Self {
        Self::all_linear()
    }
}

impl TargetModules {
    pub const DEFAULT_EXCLUDED: [&'static str; 4] =
        ["lm_head", "mm_projector", "vision_tower", "vision_resampler"];

    /// Every linear layer of the language backbone.
    pub fn all_linear() -> Self {
        Self::excluding(Self::DEFAULT_EXCLUDED)
    }

    pub fn excluding<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, path: &ModulePath, kind: ModuleKind) -> bool {
        kind == ModuleKind::Linear && !path.segments().any(|s| self.excluded.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::{ModuleKind, ModulePath, TargetModules};

    #[test]
    fn predicate_over_path_and_kind() {
        let targets = TargetModules::all_linear();
        let qkv = ModulePath::from("model.layers.0.self_attn.qkv_proj");
        assert!(targets.matches(&qkv, ModuleKind::Linear));
        assert!(!targets.matches(&qkv, ModuleKind::Norm));
        assert!(!targets.matches(&ModulePath::from("lm_head"), ModuleKind::Linear));
        assert!(!targets.matches(
            &ModulePath::from("model.mm_projector.0"),
            ModuleKind::Linear
        ));
        // exclusion is per segment, not substring
        assert!(targets.matches(
            &ModulePath::from("model.layers.1.mlp.lm_head_like"),
            ModuleKind::Linear
        ));
    }

    #[test]
    fn path_rendering() {
        let p = ModulePath::root().join("model").join(3).join("o_proj");
        assert_eq!(p.to_string(), "model.3.o_proj");
        assert_eq!(p.param("weight"), "model.3.o_proj.weight");
        assert_eq!(p.last(), Some("o_proj"));
        assert_eq!(ModulePath::root().param("lm_head"), "lm_head");
    }
}
