//! Image naming and tagging.
//!
//! The tag of a resolved image is built from independent axes. A three letter
//! prefix records which axes are populated (`i`/`a` inherited or Arca base,
//! `r`/`s` requirements or not, `d`/`e` OS dependencies or not), followed by a
//! hash fragment per populated axis. Equal configurations yield equal tags on
//! every host.

use crate::hasher::{dependency_list_fingerprint, hash_bytes};
use crate::task::protocol::PROTOCOL_VERSION;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

const FRAGMENT_LEN: usize = 32;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Splits `name[:tag]`; the tag defaults to `latest`.
    ///
    /// A colon before the last `/` belongs to a registry port, not a tag.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !name.is_empty() => Self::new(name, tag),
            _ => Self::new(reference, "latest"),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// What the first layer of an image starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    /// Built locally from the official alpine Python image
    Arca { python_version: String },
    /// Supplied by the user, used as is
    Inherited(ImageRef),
}

impl BaseImage {
    pub fn is_inherited(&self) -> bool {
        matches!(self, BaseImage::Inherited(_))
    }

    /// Name shared by every image derived from this base
    pub fn image_name(&self) -> String {
        match self {
            BaseImage::Arca { python_version } => {
                format!("arca_{}_{}", PROTOCOL_VERSION, python_version)
            }
            BaseImage::Inherited(image) => {
                let full = image.to_string();
                let slug = NON_SLUG.replace_all(&full.to_lowercase(), "_").into_owned();
                let digest = hash_bytes(full.as_bytes());
                format!("arca_inherited_{}_{}", slug.trim_matches('_'), &digest[..12])
            }
        }
    }

    /// Distinguishes bases inside a single registry repository
    pub fn registry_key(&self) -> String {
        match self {
            BaseImage::Arca { python_version } => {
                format!("{}_{}", PROTOCOL_VERSION, python_version)
            }
            BaseImage::Inherited(image) => {
                format!("i{}", &hash_bytes(image.to_string().as_bytes())[..16])
            }
        }
    }

    fn prefix(&self) -> char {
        if self.is_inherited() {
            'i'
        } else {
            'a'
        }
    }
}

/// Fully resolved identity of the image a task runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub base: BaseImage,
    pub dependencies: Vec<String>,
    /// Dependency fingerprint of the repository manifest, if it has one
    pub manifest_fingerprint: Option<String>,
}

impl ImageSpec {
    pub fn new(base: BaseImage, dependencies: Vec<String>, manifest_fingerprint: Option<String>) -> Self {
        let mut dependencies = dependencies;
        dependencies.sort();
        dependencies.dedup();
        Self {
            base,
            dependencies,
            manifest_fingerprint,
        }
    }

    fn deps_fragment(&self) -> Option<String> {
        if self.dependencies.is_empty() {
            return None;
        }
        let fingerprint = dependency_list_fingerprint(&self.dependencies);
        Some(fingerprint[..FRAGMENT_LEN].to_string())
    }

    fn manifest_fragment(&self) -> Option<String> {
        self.manifest_fingerprint
            .as_deref()
            .map(|fp| fp.chars().take(FRAGMENT_LEN).collect())
    }

    fn compose(&self, with_manifest: bool) -> String {
        let deps = self.deps_fragment();
        let manifest = self.manifest_fragment().filter(|_| with_manifest);

        let mut tag = String::with_capacity(3 + 2 * (FRAGMENT_LEN + 1));
        tag.push(self.base.prefix());
        tag.push(if manifest.is_some() { 'r' } else { 's' });
        tag.push(if deps.is_some() { 'd' } else { 'e' });
        for fragment in [deps, manifest].into_iter().flatten() {
            tag.push('_');
            tag.push_str(&fragment);
        }
        tag
    }

    pub fn tag(&self) -> String {
        self.compose(true)
    }

    pub fn image(&self) -> ImageRef {
        ImageRef::new(self.base.image_name(), self.tag())
    }

    /// The bare base layer, before dependencies or requirements
    pub fn base_layer(&self) -> ImageRef {
        let tag = format!("{}se", self.base.prefix());
        ImageRef::new(self.base.image_name(), tag)
    }

    /// OS dependency layer, shared by every manifest on top of the same
    /// dependency set. `None` without dependencies.
    pub fn dependencies_layer(&self) -> Option<ImageRef> {
        self.deps_fragment()?;
        Some(ImageRef::new(self.base.image_name(), self.compose(false)))
    }

    pub fn registry_image(&self, registry: &str) -> ImageRef {
        ImageRef::new(
            registry,
            format!("{}_{}", self.base.registry_key(), self.tag()),
        )
    }
}
