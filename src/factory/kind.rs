use crate::entry::{validate_tag, Entry};
use crate::error::{Error, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const BASE_KIND: &str = "entry";

/// Runs when an entry is classified as a kind, either on first lookup or
/// after its tags changed.
pub type KindInit = Arc<dyn Fn(&Entry) -> Result<()> + Send + Sync>;

/// Variant of entry selected from its tags.
///
/// Equality and hashing only consider the name and the tag.
#[derive(Clone)]
pub struct Kind {
    name: String,
    tag: Option<String>,
    init: Option<KindInit>,
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kind")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("init", &self.init.is_some())
            .finish()
    }
}

impl PartialEq for Kind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.tag == other.tag
    }
}

impl Eq for Kind {}

impl Hash for Kind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.tag.hash(state);
    }
}

impl Kind {
    /// The fallback kind for directories without a registered tag.
    pub fn base() -> Self {
        Self {
            name: BASE_KIND.to_string(),
            tag: None,
            init: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag that selects this kind, `None` for the base kind.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_base(&self) -> bool {
        self.tag.is_none()
    }

    /// Prepare `entry` for this kind. A no-op for kinds registered without
    /// an initialiser.
    pub fn init(&self, entry: &Entry) -> Result<()> {
        match &self.init {
            Some(init) => init(entry),
            None => Ok(()),
        }
    }
}

impl Default for Kind {
    fn default() -> Self {
        Self::base()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordered mapping from tag to [`Kind`].
///
/// When a directory carries several registered tags, the kind registered
/// first wins.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: Vec<Kind>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind named after its tag.
    pub fn register(&mut self, tag: &str) -> Result<Kind> {
        self.register_named(tag, tag)
    }

    pub fn register_named(&mut self, name: &str, tag: &str) -> Result<Kind> {
        self.insert(name, tag, None)
    }

    /// Register a kind whose `init` runs on every entry classified as it.
    pub fn register_with<F>(&mut self, name: &str, tag: &str, init: F) -> Result<Kind>
    where
        F: Fn(&Entry) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(name, tag, Some(Arc::new(init)))
    }

    fn insert(&mut self, name: &str, tag: &str, init: Option<KindInit>) -> Result<Kind> {
        validate_tag(tag)?;
        if self.get(tag).is_some() {
            return Err(Error::Registration {
                tag: tag.to_string(),
            });
        }
        let kind = Kind {
            name: name.to_string(),
            tag: Some(tag.to_string()),
            init,
        };
        self.kinds.push(kind.clone());
        Ok(kind)
    }

    pub fn get(&self, tag: &str) -> Option<&Kind> {
        self.kinds.iter().find(|kind| kind.tag() == Some(tag))
    }

    pub fn kinds(&self) -> &[Kind] {
        &self.kinds
    }

    pub fn kind_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> Kind {
        self.kinds
            .iter()
            .find(|kind| {
                tags.iter()
                    .any(|tag| kind.tag() == Some(tag.as_ref()))
            })
            .cloned()
            .unwrap_or_else(Kind::base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = KindRegistry::new();
        let project = registry.register("project").unwrap();
        let shot = registry.register_named("Shot", "shot").unwrap();

        assert_eq!(project.name(), "project");
        assert_eq!(shot.name(), "Shot");
        assert_eq!(registry.get("shot"), Some(&shot));
        assert_eq!(registry.kinds().len(), 2);
    }

    #[test]
    fn test_duplicate_tag_is_rejected() {
        let mut registry = KindRegistry::new();
        registry.register("project").unwrap();
        let err = registry.register_named("Other", "project").unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[test]
    fn test_kind_for_tags_uses_registration_order() {
        let mut registry = KindRegistry::new();
        let asset = registry.register("asset").unwrap();
        let shot = registry.register("shot").unwrap();

        assert_eq!(registry.kind_for_tags(&["shot", "asset"]), asset);
        assert_eq!(registry.kind_for_tags(&["review", "shot"]), shot);
        assert!(registry.kind_for_tags(&["review"]).is_base());
        assert!(registry.kind_for_tags::<&str>(&[]).is_base());
    }

    #[test]
    fn test_init_does_not_affect_identity() {
        let mut registry = KindRegistry::new();
        let shot = registry
            .register_with("shot", "shot", |_entry: &Entry| Ok(()))
            .unwrap();
        let plain = KindRegistry::new().register("shot").unwrap();
        assert_eq!(shot, plain);
        assert!(matches!(
            registry.register_with("again", "shot", |_entry: &Entry| Ok(())),
            Err(Error::Registration { .. })
        ));
    }
}
