use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::info;

use crate::store::TrainingDomain;
use crate::util::{file_name_component, write_json_pretty};

mod lda;
mod vectors;

use lda::LdaModel;
use vectors::VectorModel;

/// Topic probabilities below this are not reported by the local topic model.
pub const MIN_TOPIC_PROBABILITY: f64 = 0.01;

#[derive(Clone, Debug, PartialEq)]
pub struct TopicModelParams {
    pub topic_count: usize,
    pub passes: usize,
    pub chunk_size: usize,
    pub no_below: usize,
    pub no_above: f64,
    pub keep_n: Option<usize>,
}

impl From<&TrainingDomain> for TopicModelParams {
    fn from(domain: &TrainingDomain) -> Self {
        Self {
            topic_count: domain.topic_count,
            passes: domain.passes,
            chunk_size: domain.chunk_size,
            no_below: domain.no_below,
            no_above: domain.no_above,
            keep_n: domain.keep_n,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopicModelIdentity {
    pub domain: String,
    pub subdomain: String,
    pub params: TopicModelParams,
}

impl TopicModelIdentity {
    pub fn for_domain(domain: &TrainingDomain) -> Self {
        Self {
            domain: domain.domain.clone(),
            subdomain: domain.subdomain.clone(),
            params: TopicModelParams::from(domain),
        }
    }

    /// Deterministic artifact name; it doubles as the cache key on disk.
    pub fn name(&self) -> String {
        let keep = self
            .params
            .keep_n
            .map(|value| value.to_string())
            .unwrap_or_else(|| "all".to_string());
        file_name_component(&format!(
            "LDA_MODEL_{}_{}_topics{}_passes{}_chunk{}_below{}_above{:.2}_keep{}",
            self.domain,
            self.subdomain,
            self.params.topic_count,
            self.params.passes,
            self.params.chunk_size,
            self.params.no_below,
            self.params.no_above,
            keep
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorModelParams {
    pub vector_size: usize,
    pub iterations: usize,
    pub min_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorModelIdentity {
    pub frsku: String,
    pub params: VectorModelParams,
}

impl VectorModelIdentity {
    pub fn name(&self) -> String {
        format!(
            "doc2vec_MODEL_{}_size{}_iter{}_min{}",
            file_name_component(&self.frsku),
            self.params.vector_size,
            self.params.iterations,
            self.params.min_count
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelHandle {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorHandle {
    pub name: String,
    pub path: PathBuf,
}

/// A sentence as fed to the vector model: its tag and its tokens.
#[derive(Clone, Debug)]
pub struct TaggedSentence {
    pub tag: String,
    pub tokens: Vec<String>,
}

pub trait ModelService {
    /// Returns the persisted model for `identity` when one exists, training it otherwise.
    fn train_topic_model(
        &mut self,
        identity: &TopicModelIdentity,
        corpus: &[Vec<String>],
    ) -> Result<ModelHandle>;

    fn load_topic_model(&mut self, identity: &TopicModelIdentity) -> Result<Option<ModelHandle>>;

    /// One stochastic inference pass; `(topic_id, probability)` pairs in topic order.
    fn predict_topics(&mut self, handle: &ModelHandle, document: &[String])
    -> Result<Vec<(usize, f64)>>;

    /// Top weighted terms per topic, indexed by topic id.
    fn topic_terms(&mut self, handle: &ModelHandle, top_n: usize) -> Result<Vec<Vec<(String, f64)>>>;

    fn train_vector_model(
        &mut self,
        identity: &VectorModelIdentity,
        corpus: &[TaggedSentence],
    ) -> Result<VectorHandle>;

    fn load_vector_model(&mut self, identity: &VectorModelIdentity) -> Result<Option<VectorHandle>>;

    /// Nearest sentence tags to the query, best first.
    fn infer_similar(
        &mut self,
        handle: &VectorHandle,
        query_terms: &[String],
        top_n: usize,
    ) -> Result<Vec<(String, f64)>>;
}

pub struct LocalModelService {
    models_root: PathBuf,
    rng: StdRng,
    topic_models: HashMap<String, LdaModel>,
    vector_models: HashMap<String, VectorModel>,
}

impl LocalModelService {
    pub fn new(models_root: &Path, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(value) => StdRng::seed_from_u64(value),
            None => StdRng::from_os_rng(),
        };
        Self {
            models_root: models_root.to_path_buf(),
            rng,
            topic_models: HashMap::new(),
            vector_models: HashMap::new(),
        }
    }

    pub fn topic_model_path(&self, name: &str) -> PathBuf {
        self.models_root.join("lda").join(format!("{name}.json"))
    }

    pub fn vector_model_path(&self, name: &str) -> PathBuf {
        self.models_root.join("doc2vec").join(format!("{name}.json"))
    }

    fn topic_model(&mut self, handle: &ModelHandle) -> Result<&LdaModel> {
        if !self.topic_models.contains_key(&handle.name) {
            let model: LdaModel = read_json(&handle.path)?;
            self.topic_models.insert(handle.name.clone(), model);
        }
        match self.topic_models.get(&handle.name) {
            Some(model) => Ok(model),
            None => bail!("topic model {} is not loaded", handle.name),
        }
    }

    fn vector_model(&mut self, handle: &VectorHandle) -> Result<&VectorModel> {
        if !self.vector_models.contains_key(&handle.name) {
            let model: VectorModel = read_json(&handle.path)?;
            self.vector_models.insert(handle.name.clone(), model);
        }
        match self.vector_models.get(&handle.name) {
            Some(model) => Ok(model),
            None => bail!("vector model {} is not loaded", handle.name),
        }
    }
}

impl ModelService for LocalModelService {
    fn train_topic_model(
        &mut self,
        identity: &TopicModelIdentity,
        corpus: &[Vec<String>],
    ) -> Result<ModelHandle> {
        if let Some(handle) = self.load_topic_model(identity)? {
            info!(model = %handle.name, "topic model already trained");
            return Ok(handle);
        }

        let name = identity.name();
        let path = self.topic_model_path(&name);
        info!(model = %name, documents = corpus.len(), "training topic model");

        let model = LdaModel::train(&name, corpus, &identity.params, &mut self.rng)?;
        write_json_pretty(&path, &model)?;
        info!(
            model = %name,
            vocabulary = model.vocabulary.len(),
            topics = model.topic_count,
            path = %path.display(),
            "saved topic model"
        );
        self.topic_models.insert(name.clone(), model);

        Ok(ModelHandle { name, path })
    }

    fn load_topic_model(&mut self, identity: &TopicModelIdentity) -> Result<Option<ModelHandle>> {
        let name = identity.name();
        let path = self.topic_model_path(&name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(ModelHandle { name, path }))
    }

    fn predict_topics(
        &mut self,
        handle: &ModelHandle,
        document: &[String],
    ) -> Result<Vec<(usize, f64)>> {
        self.topic_model(handle)?;
        let Some(model) = self.topic_models.get(&handle.name) else {
            bail!("topic model {} is not loaded", handle.name);
        };
        Ok(model.infer(document, &mut self.rng))
    }

    fn topic_terms(&mut self, handle: &ModelHandle, top_n: usize) -> Result<Vec<Vec<(String, f64)>>> {
        let model = self.topic_model(handle)?;
        Ok((0..model.topic_count)
            .map(|topic| model.top_terms(topic, top_n))
            .collect())
    }

    fn train_vector_model(
        &mut self,
        identity: &VectorModelIdentity,
        corpus: &[TaggedSentence],
    ) -> Result<VectorHandle> {
        if let Some(handle) = self.load_vector_model(identity)? {
            info!(model = %handle.name, "vector model already trained");
            return Ok(handle);
        }

        let name = identity.name();
        let path = self.vector_model_path(&name);
        info!(model = %name, sentences = corpus.len(), "training vector model");

        let model = VectorModel::train(&name, corpus, &identity.params, &mut self.rng)?;
        write_json_pretty(&path, &model)?;
        info!(
            model = %name,
            vocabulary = model.vocabulary.len(),
            path = %path.display(),
            "saved vector model"
        );
        self.vector_models.insert(name.clone(), model);

        Ok(VectorHandle { name, path })
    }

    fn load_vector_model(&mut self, identity: &VectorModelIdentity) -> Result<Option<VectorHandle>> {
        let name = identity.name();
        let path = self.vector_model_path(&name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(VectorHandle { name, path }))
    }

    fn infer_similar(
        &mut self,
        handle: &VectorHandle,
        query_terms: &[String],
        top_n: usize,
    ) -> Result<Vec<(String, f64)>> {
        self.vector_model(handle)?;
        let Some(model) = self.vector_models.get(&handle.name) else {
            bail!("vector model {} is not loaded", handle.name);
        };
        Ok(model.most_similar(query_terms, top_n, &mut self.rng))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
