//! Mustache-style templates that recompile when any file they read changes.
//!
//! [`TemplateManager::compile`] returns a [`Template`] handle. Every
//! [`Template::execute`] re-checks the compiled template's dependency set
//! (the template itself plus every partial it pulled in) and recompiles
//! through the shared single-flight cache when something moved.

mod parser;
mod render;

use std::{collections::HashMap, path::Path, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cache::{ArtifactCache, CacheConfig, CacheEntry, CacheError, CompilationContext};
use crate::convert::ConversionError;
use crate::resources::{Resource, ResourceError, ResourceStore};

use render::Unit;

pub use render::RenderError;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Cache(CacheError),
    #[error("failed to render `{template}`")]
    Render {
        template: String,
        #[source]
        source: RenderError,
    },
}

impl From<CacheError> for TemplateError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(name) => Self::NotFound(name),
            other => Self::Cache(other),
        }
    }
}

/// A parsed template together with every partial it can reach, each parsed once.
#[derive(Debug)]
pub struct CompiledTemplate {
    root: String,
    units: HashMap<String, Unit>,
}

impl CompiledTemplate {
    pub fn render(&self, scope: &Value) -> Result<String, RenderError> {
        render::render(&self.units, &self.root, scope)
    }
}

#[derive(Clone)]
pub struct TemplateManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: ResourceStore,
    cache: ArtifactCache<CompiledTemplate>,
    suffix: Arc<str>,
}

impl TemplateManager {
    /// `suffix` is the default template extension, without the dot.
    pub fn new(store: ResourceStore, config: CacheConfig, suffix: &str) -> Self {
        let cache = ArtifactCache::new("templates", store.clone(), config);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                cache,
                suffix: Arc::from(suffix.trim_start_matches('.')),
            }),
        }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.inner.store
    }

    /// Resolve a template by exact name, then with the default suffix.
    pub fn resolve(&self, name: &str) -> Option<Resource> {
        let suffixed = format!("{name}.{}", self.inner.suffix);
        if name.ends_with(&format!(".{}", self.inner.suffix)) {
            return self.inner.store.resolve(name);
        }
        self.inner.store.resolve_any([name, suffixed.as_str()])
    }

    pub fn can_compile(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Compile `name` now and return a handle that stays current.
    pub async fn compile(&self, name: &str) -> Result<Template, TemplateError> {
        let resource = self
            .resolve(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
        self.load(&resource).await?;
        Ok(Template {
            manager: self.clone(),
            resource,
        })
    }

    async fn load(
        &self,
        resource: &Resource,
    ) -> Result<Arc<CacheEntry<CompiledTemplate>>, TemplateError> {
        let suffix = Arc::clone(&self.inner.suffix);
        let entry = self
            .inner
            .cache
            .get(resource, move |context| compile_template(context, &suffix))
            .await?;
        Ok(entry)
    }
}

/// Handle on a compiled template.
#[derive(Clone)]
pub struct Template {
    manager: TemplateManager,
    resource: Resource,
}

impl Template {
    pub fn name(&self) -> &str {
        self.resource.key()
    }

    /// Render against `scope`, recompiling first if any dependency changed.
    pub async fn execute(&self, scope: &Value) -> Result<String, TemplateError> {
        let entry = self.manager.load(&self.resource).await?;
        entry
            .artifact()
            .render(scope)
            .map_err(|source| TemplateError::Render {
                template: self.name().to_string(),
                source,
            })
    }
}

fn compile_template(
    context: &mut CompilationContext,
    suffix: &str,
) -> Result<CompiledTemplate, ConversionError> {
    let source = context.read_primary()?;
    let root = context.primary().key().to_string();
    let mut units: HashMap<String, Unit> = HashMap::new();
    let mut pending = vec![(root.clone(), parser::parse(&source)?)];

    while let Some((key, nodes)) = pending.pop() {
        let mut partials = HashMap::new();
        for name in parser::partial_names(&nodes) {
            let candidates = partial_candidates(name, &key, suffix);
            let resource = context
                .store()
                .resolve_any(candidates.iter().map(String::as_str))
                .ok_or_else(|| ResourceError::NotFound(name.to_string()))?;
            let target = resource.key().to_string();

            let known = target == key
                || units.contains_key(&target)
                || pending.iter().any(|(queued, _)| *queued == target);
            if !known {
                debug!(partial = %target, including = %key, "compiling partial");
                let source = context.read(&resource)?;
                pending.push((target.clone(), parser::parse(&source)?));
            }
            partials.insert(name.to_string(), target);
        }
        units.insert(key, Unit { nodes, partials });
    }

    Ok(CompiledTemplate { root, units })
}

/// Exact name, then the including template's extension, then the default suffix.
fn partial_candidates(name: &str, including: &str, suffix: &str) -> Vec<String> {
    let mut candidates = vec![name.to_string()];
    if let Some(extension) = Path::new(including).extension().and_then(|ext| ext.to_str()) {
        candidates.push(format!("{name}.{extension}"));
    }
    let suffixed = format!("{name}.{suffix}");
    if !candidates.contains(&suffixed) {
        candidates.push(suffixed);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn manager(dir: &Path) -> TemplateManager {
        let store = ResourceStore::new(dir).expect("store");
        TemplateManager::new(store, CacheConfig::default(), "mustache")
    }

    #[test]
    fn partial_candidates_follow_the_including_extension() {
        assert_eq!(
            partial_candidates("b", "a.tpl", "mustache"),
            vec!["b", "b.tpl", "b.mustache"]
        );
        assert_eq!(
            partial_candidates("b", "a.mustache", "mustache"),
            vec!["b", "b.mustache"]
        );
    }

    #[tokio::test]
    async fn names_fall_back_to_the_default_suffix() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("page.mustache"), "hi {{who}}").expect("write");
        let manager = manager(dir.path());

        assert!(manager.can_compile("page"));
        assert!(manager.can_compile("page.mustache"));
        assert!(!manager.can_compile("absent"));

        let template = manager.compile("page").await.expect("compiled");
        assert_eq!(template.name(), "page.mustache");
        let out = template
            .execute(&json!({ "who": "there" }))
            .await
            .expect("rendered");
        assert_eq!(out, "hi there");
    }

    #[tokio::test]
    async fn missing_templates_and_partials_fail() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("a.tpl"), "{{>nope}}").expect("write");
        let manager = manager(dir.path());

        assert!(matches!(
            manager.compile("absent").await,
            Err(TemplateError::NotFound(name)) if name == "absent"
        ));
        assert!(matches!(
            manager.compile("a.tpl").await,
            Err(TemplateError::Cache(CacheError::Conversion { ref path, .. })) if path == "a.tpl"
        ));
    }

    #[tokio::test]
    async fn unbounded_self_inclusion_fails_when_rendered() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("loop.tpl"), "x{{>loop}}").expect("write");
        let manager = manager(dir.path());

        let template = manager.compile("loop.tpl").await.expect("compiled");
        let err = template.execute(&json!({})).await.err().expect("depth error");
        assert!(matches!(
            err,
            TemplateError::Render {
                ref template,
                source: RenderError::TooDeep { .. },
            } if template == "loop.tpl"
        ));
    }

    #[test]
    fn shared_partials_are_read_and_parsed_once() {
        let dir = tempdir().expect("temp dir");
        let levels = 40;
        for level in 0..levels {
            fs::write(
                dir.path().join(format!("p{level}.tpl")),
                format!("{{{{#more}}}}{{{{>p{next}}}}}{{{{>p{next}}}}}{{{{/more}}}}", next = level + 1),
            )
            .expect("write level");
        }
        fs::write(dir.path().join(format!("p{levels}.tpl")), "leaf").expect("write leaf");

        let store = ResourceStore::new(dir.path()).expect("store");
        let primary = store.resolve("p0.tpl").expect("primary");
        let mut context = CompilationContext::new(store, primary);
        let compiled = compile_template(&mut context, "mustache").expect("compiled");

        assert_eq!(compiled.units.len(), levels + 1);
        assert_eq!(context.include_count(), levels);
        assert_eq!(compiled.render(&json!({})).expect("rendered"), "");
    }

    #[test]
    fn partials_resolve_from_the_including_file() {
        let dir = tempdir().expect("temp dir");
        fs::create_dir(dir.path().join("views")).expect("dir");
        fs::write(dir.path().join("page.tpl"), "[{{>views/card}}]").expect("write");
        fs::write(dir.path().join("views/card.tpl"), "<{{>footer}}>").expect("write");
        fs::write(dir.path().join("footer.mustache"), "f").expect("write");

        let store = ResourceStore::new(dir.path()).expect("store");
        let primary = store.resolve("page.tpl").expect("primary");
        let mut context = CompilationContext::new(store, primary);
        let compiled = compile_template(&mut context, "mustache").expect("compiled");

        assert_eq!(compiled.render(&json!({})).expect("rendered"), "[<f>]");
        let dependencies = context.dependency_set().expect("dependencies");
        assert!(dependencies.contains("views/card.tpl"));
        assert!(dependencies.contains("footer.mustache"));
    }
}
