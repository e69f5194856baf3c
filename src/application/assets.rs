//! Artifact lookup for the asset surface.
//!
//! Decides, per requested path, whether the file is compiled through the
//! artifact cache (stylesheets, scripts when minifying, JSON) or streamed
//! from disk as-is, and which media type the result carries.

use std::{fmt, sync::Arc, time::SystemTime};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::{ArtifactCache, CacheConfig, CacheEntry, CacheError, CompilationContext};
use crate::convert::{
    ConversionError, ConvertOptions, Converter, JsonNormalizer, LessConverter, ScriptMinifier,
};
use crate::resources::{Resource, ResourceError, ResourceStore};

pub const CSS_MEDIA_TYPE: &str = "text/css; charset=utf-8";
pub const SCRIPT_MEDIA_TYPE: &str = "application/javascript; charset=utf-8";
pub const JSON_MEDIA_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset `{0}` not found")]
    NotFound(String),
    #[error("asset `{key}` rejected: compilation queue is full")]
    Rejected { key: String },
    #[error(transparent)]
    Compile(CacheError),
    #[error(transparent)]
    Io(ResourceError),
}

impl From<CacheError> for AssetError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(key) => Self::NotFound(key),
            CacheError::Rejected { key } => Self::Rejected { key },
            other => Self::Compile(other),
        }
    }
}

impl From<ResourceError> for AssetError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::NotFound(key) => Self::NotFound(key),
            other => Self::Io(other),
        }
    }
}

/// How requests map onto converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetPolicy {
    pub minify: bool,
    /// Serve `name.less` for a missing `name.css`.
    pub less_fallback: bool,
    pub pretty_json: bool,
}

impl Default for AssetPolicy {
    fn default() -> Self {
        Self {
            minify: false,
            less_fallback: true,
            pretty_json: true,
        }
    }
}

/// The converters an [`AssetService`] dispatches to.
#[derive(Clone)]
pub struct Converters {
    stylesheet: Arc<dyn Converter>,
    script: Arc<dyn Converter>,
    json: Arc<dyn Converter>,
}

impl Default for Converters {
    fn default() -> Self {
        Self {
            stylesheet: Arc::new(LessConverter),
            script: Arc::new(ScriptMinifier),
            json: Arc::new(JsonNormalizer),
        }
    }
}

impl Converters {
    pub fn with_stylesheet(mut self, converter: impl Converter + 'static) -> Self {
        self.stylesheet = Arc::new(converter);
        self
    }

    pub fn with_script(mut self, converter: impl Converter + 'static) -> Self {
        self.script = Arc::new(converter);
        self
    }

    pub fn with_json(mut self, converter: impl Converter + 'static) -> Self {
        self.json = Arc::new(converter);
        self
    }
}

/// Immutable compiled output, shared by every response built from it.
#[derive(Debug, Clone)]
pub struct Artifact {
    content: Bytes,
    media_type: &'static str,
    etag: String,
}

impl Artifact {
    pub fn new(content: impl Into<Bytes>, media_type: &'static str) -> Self {
        let content = content.into();
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let etag = format!("\"{}\"", hex::encode(hasher.finalize().as_slice()));
        Self {
            content,
            media_type,
            etag,
        }
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn media_type(&self) -> &'static str {
        self.media_type
    }

    /// Strong entity tag, quoted.
    pub fn etag(&self) -> &str {
        &self.etag
    }
}

/// Result of [`AssetService::get_artifact`].
pub enum Asset {
    Compiled(Arc<CacheEntry<Artifact>>),
    File {
        key: String,
        content: Bytes,
        media_type: String,
        last_modified: SystemTime,
    },
}

impl Asset {
    pub fn key(&self) -> &str {
        match self {
            Asset::Compiled(entry) => entry.key(),
            Asset::File { key, .. } => key,
        }
    }

    /// A fresh handle on the bytes; the underlying buffer is shared.
    pub fn content(&self) -> Bytes {
        match self {
            Asset::Compiled(entry) => entry.artifact().content().clone(),
            Asset::File { content, .. } => content.clone(),
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Asset::Compiled(entry) => entry.artifact().media_type(),
            Asset::File { media_type, .. } => media_type,
        }
    }

    /// Newest modification time among everything the asset was built from.
    pub fn last_modified(&self) -> SystemTime {
        match self {
            Asset::Compiled(entry) => entry.dependencies().last_modified(),
            Asset::File { last_modified, .. } => *last_modified,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            Asset::Compiled(entry) => Some(entry.artifact().etag()),
            Asset::File { .. } => None,
        }
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("key", &self.key())
            .field("media_type", &self.media_type())
            .field("compiled", &matches!(self, Asset::Compiled(_)))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Stylesheet,
    Script,
    Json,
}

#[derive(Clone)]
pub struct AssetService {
    store: ResourceStore,
    cache: ArtifactCache<Artifact>,
    converters: Converters,
    policy: AssetPolicy,
}

impl AssetService {
    pub fn new(store: ResourceStore, config: CacheConfig, policy: AssetPolicy) -> Self {
        let cache = ArtifactCache::new("assets", store.clone(), config);
        Self {
            store,
            cache,
            converters: Converters::default(),
            policy,
        }
    }

    pub fn with_converters(mut self, converters: Converters) -> Self {
        self.converters = converters;
        self
    }

    pub fn policy(&self) -> AssetPolicy {
        self.policy
    }

    pub fn cache(&self) -> &ArtifactCache<Artifact> {
        &self.cache
    }

    /// Resolve `path` and return its artifact, compiling it if needed.
    #[instrument(skip(self), fields(key = tracing::field::Empty))]
    pub async fn get_artifact(&self, path: &str) -> Result<Asset, AssetError> {
        let requested = path.trim_start_matches('/');
        if requested.is_empty() {
            return Err(AssetError::NotFound(path.to_string()));
        }
        let resource = self
            .resolve(requested)
            .ok_or_else(|| AssetError::NotFound(requested.to_string()))?;
        tracing::Span::current().record("key", resource.key());

        match self.pipeline(&resource) {
            Some(pipeline) => self.compiled(&resource, pipeline).await,
            None => read_file(&resource).await,
        }
    }

    /// The requested extension wins; `.less` is only tried when the `.css`
    /// file itself is absent.
    fn resolve(&self, requested: &str) -> Option<Resource> {
        if let Some(resource) = self.store.resolve(requested) {
            return Some(resource);
        }
        let stem = requested.strip_suffix(".css")?;
        if !self.policy.less_fallback {
            return None;
        }
        let fallback = format!("{stem}.less");
        debug!(requested, fallback = %fallback, "trying stylesheet source fallback");
        self.store.resolve(&fallback)
    }

    fn pipeline(&self, resource: &Resource) -> Option<Pipeline> {
        match resource.extension()? {
            "less" => Some(Pipeline::Stylesheet),
            "css" if self.policy.minify => Some(Pipeline::Stylesheet),
            "js" if self.policy.minify => Some(Pipeline::Script),
            "json" => Some(Pipeline::Json),
            _ => None,
        }
    }

    async fn compiled(&self, resource: &Resource, pipeline: Pipeline) -> Result<Asset, AssetError> {
        let (converter, minify, media_type) = match pipeline {
            Pipeline::Stylesheet => (
                Arc::clone(&self.converters.stylesheet),
                self.policy.minify,
                CSS_MEDIA_TYPE,
            ),
            Pipeline::Script => (Arc::clone(&self.converters.script), true, SCRIPT_MEDIA_TYPE),
            Pipeline::Json => (
                Arc::clone(&self.converters.json),
                !self.policy.pretty_json,
                JSON_MEDIA_TYPE,
            ),
        };

        let entry = self
            .cache
            .get(resource, move |context| {
                convert_primary(context, converter.as_ref(), minify, media_type)
            })
            .await?;
        Ok(Asset::Compiled(entry))
    }
}

fn convert_primary(
    context: &mut CompilationContext,
    converter: &dyn Converter,
    minify: bool,
    media_type: &'static str,
) -> Result<Artifact, ConversionError> {
    let source = context.read_primary()?;
    let options = ConvertOptions::new(context.primary().key(), minify);
    let output = converter.convert(&source, &options, context)?;
    Ok(Artifact::new(output, media_type))
}

async fn read_file(resource: &Resource) -> Result<Asset, AssetError> {
    let metadata = tokio::fs::metadata(resource.path())
        .await
        .map_err(|err| ResourceError::io(resource.key(), err))?;
    let last_modified = metadata
        .modified()
        .map_err(|err| ResourceError::io(resource.key(), err))?;
    let content = tokio::fs::read(resource.path())
        .await
        .map_err(|err| ResourceError::io(resource.key(), err))?;

    Ok(Asset::File {
        key: resource.key().to_string(),
        content: Bytes::from(content),
        media_type: media_type_for(resource.key()),
        last_modified,
    })
}

/// Guess a media type from the file name; textual types get a UTF-8 charset.
pub fn media_type_for(name: &str) -> String {
    let mime = mime_guess::from_path(name).first_or_octet_stream();
    let essence = mime.essence_str();
    if essence.starts_with("text/")
        || essence == "application/javascript"
        || essence == "application/json"
    {
        format!("{essence}; charset=utf-8")
    } else {
        essence.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    use super::*;
    use crate::convert::IncludeFetcher;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Converter for Counting {
        fn convert(
            &self,
            source: &str,
            _options: &ConvertOptions,
            _includes: &mut dyn IncludeFetcher,
        ) -> Result<String, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(source.to_uppercase())
        }
    }

    fn service(dir: &std::path::Path, policy: AssetPolicy) -> AssetService {
        let store = ResourceStore::new(dir).expect("store");
        AssetService::new(store, CacheConfig::default(), policy)
    }

    #[test]
    fn media_types_carry_charsets_for_text() {
        assert_eq!(media_type_for("a.html"), "text/html; charset=utf-8");
        assert_eq!(media_type_for("a.png"), "image/png");
        assert_eq!(media_type_for("a.unknownext"), "application/octet-stream");
        assert!(media_type_for("a.js").ends_with("; charset=utf-8"));
    }

    #[test]
    fn etags_are_quoted_sha256_digests() {
        let artifact = Artifact::new("abc", CSS_MEDIA_TYPE);
        assert_eq!(
            artifact.etag(),
            "\"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad\""
        );
    }

    #[tokio::test]
    async fn empty_and_missing_paths_are_not_found() {
        let dir = tempdir().expect("temp dir");
        let assets = service(dir.path(), AssetPolicy::default());

        assert!(matches!(assets.get_artifact("").await, Err(AssetError::NotFound(_))));
        assert!(matches!(assets.get_artifact("/").await, Err(AssetError::NotFound(_))));
        assert!(matches!(
            assets.get_artifact("nope.txt").await,
            Err(AssetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn css_falls_back_to_less_only_when_missing() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("site.less"), "@c: red;\n.a { color: @c; }").expect("write");
        fs::write(dir.path().join("plain.css"), ".b { top: 0 }").expect("write");
        fs::write(dir.path().join("plain.less"), ".c { top: 1px }").expect("write");
        let assets = service(dir.path(), AssetPolicy::default());

        let fallback = assets.get_artifact("site.css").await.expect("fallback");
        assert_eq!(fallback.key(), "site.less");
        assert_eq!(fallback.media_type(), CSS_MEDIA_TYPE);
        assert_eq!(&fallback.content()[..], b".a {\n  color: red;\n}\n");

        let direct = assets.get_artifact("plain.css").await.expect("direct");
        assert_eq!(direct.key(), "plain.css");
        assert!(direct.etag().is_none());
        assert_eq!(&direct.content()[..], b".b { top: 0 }");
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("site.less"), ".a { top: 0 }").expect("write");
        let policy = AssetPolicy {
            less_fallback: false,
            ..AssetPolicy::default()
        };
        let assets = service(dir.path(), policy);

        assert!(matches!(
            assets.get_artifact("site.css").await,
            Err(AssetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn minify_routes_scripts_and_stylesheets_through_converters() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("app.js"), "var a = 1;").expect("write");
        fs::write(dir.path().join("site.css"), ".foo { left: 1px; }").expect("write");
        fs::write(dir.path().join("data.json"), "{ \"foo\" : \"bar\" }").expect("write");
        let policy = AssetPolicy {
            minify: true,
            less_fallback: true,
            pretty_json: false,
        };
        let assets = service(dir.path(), policy);

        let script = assets.get_artifact("app.js").await.expect("script");
        assert_eq!(&script.content()[..], b"var a=1;");
        assert_eq!(script.media_type(), SCRIPT_MEDIA_TYPE);

        let css = assets.get_artifact("site.css").await.expect("css");
        assert_eq!(&css.content()[..], b".foo{left:1px}");

        let json = assets.get_artifact("data.json").await.expect("json");
        assert_eq!(&json.content()[..], br#"{"foo":"bar"}"#);
        assert_eq!(json.media_type(), JSON_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn unminified_scripts_are_served_raw() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("app.js"), "var a = 1;").expect("write");
        let assets = service(dir.path(), AssetPolicy::default());

        let script = assets.get_artifact("app.js").await.expect("script");
        assert!(matches!(script, Asset::File { .. }));
        assert_eq!(&script.content()[..], b"var a = 1;");
        assert!(assets.cache().is_empty());
    }

    #[tokio::test]
    async fn converters_are_injectable_and_results_cached() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("site.less"), "abc").expect("write");
        let calls = Arc::new(AtomicUsize::new(0));
        let assets = service(dir.path(), AssetPolicy::default()).with_converters(
            Converters::default().with_stylesheet(Counting {
                calls: Arc::clone(&calls),
            }),
        );

        for _ in 0..3 {
            let asset = assets.get_artifact("site.less").await.expect("compiled");
            assert_eq!(&asset.content()[..], b"ABC");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_sources_surface_as_compile_errors() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("data.json"), "{ nope").expect("write");
        let assets = service(dir.path(), AssetPolicy::default());

        assert!(matches!(
            assets.get_artifact("data.json").await,
            Err(AssetError::Compile(CacheError::Conversion { ref path, .. })) if path == "data.json"
        ));
    }
}
