use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use futures::{stream, Stream, TryStreamExt};
use reqwest::{header::HeaderMap, Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};

use crate::{
    config::AnnotationConfig,
    error::{Error, Result},
    http,
};

/// Tag that marks an existing project as safe to overwrite on upsert.
pub const UPDATE_TAG: &str = "allow_update";
const CSRF_COOKIE: &str = "csrftoken";
const CSRF_HEADER: &str = "X-CSRFToken";
const DEFAULT_BACKGROUND: &str = "#209cee";
const DEFAULT_TEXT_COLOR: &str = "#ffffff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectType {
    DocumentClassification,
    SequenceLabeling,
    Seq2seq,
    IntentDetectionAndSlotFilling,
    ImageClassification,
    Speech2text,
}

impl ProjectType {
    fn resource_type(self) -> &'static str {
        match self {
            ProjectType::DocumentClassification => "TextClassificationProject",
            ProjectType::SequenceLabeling => "SequenceLabelingProject",
            ProjectType::Seq2seq => "Seq2seqProject",
            ProjectType::IntentDetectionAndSlotFilling => "IntentDetectionAndSlotFillingProject",
            ProjectType::ImageClassification => "ImageClassificationProject",
            ProjectType::Speech2text => "Speech2textProject",
        }
    }
}

/// Which label taxonomy a label belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    #[default]
    Category,
    Span,
    Relation,
}

impl LabelKind {
    fn endpoint(self) -> &'static str {
        match self {
            LabelKind::Category => "category-types",
            LabelKind::Span => "span-types",
            LabelKind::Relation => "relation-types",
        }
    }
}

/// Everything needed to create or update a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    pub project_type: ProjectType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub guideline: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub label_type: LabelKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Tag {
    Text(String),
    Object { text: String },
}

impl Tag {
    fn text(&self) -> &str {
        match self {
            Tag::Text(text) | Tag::Object { text } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationProject {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub guideline: String,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl AnnotationProject {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.text() == tag)
    }
}

/// What gets written to disk for every created or updated project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub id: u64,
    pub name: String,
    pub project_type: ProjectType,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelType {
    pub id: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub id: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct Category {
    label: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
}

/// A document's text with the human readable labels assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelledSample {
    pub text: String,
    pub labels: Vec<String>,
}

struct SampleState {
    project_id: u64,
    label_map: Option<HashMap<u64, String>>,
    buffer: VecDeque<Example>,
    next: Option<String>,
    started: bool,
}

/// An authenticated session with the annotation server.
pub struct AnnotationClient {
    server: String,
    client: Client,
    csrf_token: Option<String>,
    project_dir: PathBuf,
    profile: UserProfile,
    current_project: Option<u64>,
}

impl AnnotationClient {
    /// Logs in and fetches the profile of the logged in user.
    #[instrument(skip_all, fields(server = %config.server))]
    pub async fn connect(config: &AnnotationConfig) -> Result<Self> {
        let server = config.server.trim_end_matches('/').to_string();
        let client = http::builder(&config.transport, HeaderMap::new())?
            .cookie_store(true)
            .build()?;

        let resp = client
            .post(format!("{server}/v1/auth/login/"))
            .json(&json!({ "username": config.username, "password": config.password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let reason = format!("{}: {}", resp.status(), resp.text().await.unwrap_or_default());
            return Err(Error::Authentication { server, reason });
        }

        let csrf_token = resp
            .cookies()
            .find(|c| c.name() == CSRF_COOKIE)
            .map(|c| c.value().to_string());

        let profile: UserProfile =
            http::read_json(client.get(format!("{server}/v1/me")).send().await?).await?;
        info!("connected as {}", profile.username);

        Ok(Self {
            server,
            client,
            csrf_token,
            project_dir: config.project_dir.clone(),
            profile,
            current_project: None,
        })
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn current_project(&self) -> Option<u64> {
        self.current_project
    }

    pub fn set_current_project(&mut self, project_id: u64) {
        self.current_project = Some(project_id);
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.server, path)
    }

    fn mutate(&self, method: Method, url: String) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.csrf_token {
            Some(token) => request.header(CSRF_HEADER, token),
            None => request,
        }
    }

    fn project_id(&self, explicit: Option<u64>) -> Result<u64> {
        explicit
            .or(self.current_project)
            .ok_or_else(|| Error::IncompleteReference("no project id specified or available".into()))
    }

    pub async fn list_projects(&self) -> Result<Vec<AnnotationProject>> {
        http::fetch_all(&self.client, &self.url("projects")).await
    }

    /// Creates the project, or updates it when exactly one project of that name
    /// exists and carries the update tag.
    ///
    /// Labels are only registered for newly created projects.
    #[instrument(skip_all, fields(name = %spec.name))]
    pub async fn upsert_project(&mut self, spec: &ProjectSpec) -> Result<AnnotationProject> {
        let mut matches: Vec<AnnotationProject> = self
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| p.name == spec.name)
            .collect();
        if matches.len() > 1 {
            return Err(Error::AmbiguousEntity {
                kind: "project",
                name: spec.name.clone(),
                count: matches.len(),
            });
        }

        let body = json!({
            "name": spec.name,
            "project_type": spec.project_type,
            "description": spec.description,
            "guideline": spec.guideline,
            "resourcetype": spec.project_type.resource_type(),
        });

        let (project, created) = match matches.pop() {
            Some(existing) => {
                if !existing.has_tag(UPDATE_TAG) {
                    return Err(Error::Permission(format!(
                        "project {} ({}) is not tagged {UPDATE_TAG}",
                        existing.name, existing.id
                    )));
                }
                let url = self.url(&format!("projects/{}", existing.id));
                let project: AnnotationProject =
                    http::read_json(self.mutate(Method::PUT, url).json(&body).send().await?)
                        .await?;
                info!("updated project {}", project.id);
                (project, false)
            }
            None => {
                let url = self.url("projects");
                let response = match self.mutate(Method::POST, url).json(&body).send().await {
                    Ok(resp) => http::read_json::<AnnotationProject>(resp).await,
                    Err(e) => Err(e.into()),
                };
                let project = response.map_err(|e| {
                    error!("failed to create project: {e}");
                    e
                })?;
                info!("created project {}", project.id);
                (project, true)
            }
        };

        self.current_project = Some(project.id);
        self.write_metadata(&project, spec).await?;
        if created {
            self.register_labels(&spec.labels, spec.label_type, Some(project.id))
                .await?;
        }
        Ok(project)
    }

    async fn write_metadata(&self, project: &AnnotationProject, spec: &ProjectSpec) -> Result<PathBuf> {
        let metadata = ProjectMetadata {
            id: project.id,
            name: project.name.clone(),
            project_type: spec.project_type,
            description: project.description.clone(),
            created_at: project.created_at.unwrap_or_else(Utc::now),
        };
        tokio::fs::create_dir_all(&self.project_dir)
            .await
            .map_err(|e| Error::file(&self.project_dir, e))?;
        let path = self.project_dir.join(format!("project_{}.json", project.id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&metadata)?)
            .await
            .map_err(|e| Error::file(&path, e))?;
        debug!("wrote project metadata to {}", path.display());
        Ok(path)
    }

    /// Registers each label against the given project, or the current one.
    #[instrument(skip(self, labels))]
    pub async fn register_labels(
        &self,
        labels: &[String],
        kind: LabelKind,
        project_id: Option<u64>,
    ) -> Result<Vec<String>> {
        let project_id = self.project_id(project_id)?;
        let url = self.url(&format!("projects/{project_id}/{}", kind.endpoint()));
        for label in labels {
            let body = json!({
                "text": label,
                "background_color": DEFAULT_BACKGROUND,
                "text_color": DEFAULT_TEXT_COLOR,
            });
            http::ensure_success(self.mutate(Method::POST, url.clone()).json(&body).send().await?)
                .await?;
        }
        Ok(labels.to_vec())
    }

    pub async fn list_label_types(&self, project_id: u64, kind: LabelKind) -> Result<Vec<LabelType>> {
        http::fetch_all(
            &self.client,
            &self.url(&format!("projects/{project_id}/{}", kind.endpoint())),
        )
        .await
    }

    /// Maps category label ids to their text.
    pub async fn label_map(&self, project_id: u64) -> Result<HashMap<u64, String>> {
        Ok(self
            .list_label_types(project_id, LabelKind::Category)
            .await?
            .into_iter()
            .map(|label| (label.id, label.text))
            .collect())
    }

    /// Loads a single document into the given project, or the current one.
    pub async fn load_document(
        &self,
        text: &str,
        meta: Option<Value>,
        project_id: Option<u64>,
    ) -> Result<Example> {
        let project_id = self.project_id(project_id)?;
        let body = json!({ "text": text, "meta": meta.unwrap_or_else(|| json!({})) });
        let url = self.url(&format!("projects/{project_id}/examples"));
        let result: Result<Example> = match self.mutate(Method::POST, url).json(&body).send().await {
            Ok(resp) => http::read_json(resp).await,
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| {
            error!("failed to load document: {e}");
            e
        })
    }

    /// Loads a document and attaches a category for each label text.
    ///
    /// Every label must already exist in the project; nothing is created otherwise.
    pub async fn load_labelled_sample(
        &self,
        sample: &LabelledSample,
        project_id: Option<u64>,
    ) -> Result<Example> {
        let project_id = self.project_id(project_id)?;
        let by_text: HashMap<String, u64> = self
            .label_map(project_id)
            .await?
            .into_iter()
            .map(|(id, text)| (text, id))
            .collect();

        let mut missing = Vec::new();
        let mut label_ids = Vec::new();
        for label in &sample.labels {
            match by_text.get(label) {
                Some(id) => label_ids.push(*id),
                None => missing.push(label.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::NotFound {
                kind: "label",
                names: missing,
            });
        }

        let example = self
            .load_document(&sample.text, None, Some(project_id))
            .await?;
        let url = self.url(&format!(
            "projects/{project_id}/examples/{}/categories",
            example.id
        ));
        for label in label_ids {
            http::ensure_success(
                self.mutate(Method::POST, url.clone())
                    .json(&json!({ "label": label }))
                    .send()
                    .await?,
            )
            .await?;
        }
        Ok(example)
    }

    /// Loads one JSON document of the form `{"text": ..., "meta": {...}}`.
    pub async fn load_from_file(&self, path: &Path, project_id: Option<u64>) -> Result<Example> {
        #[derive(Deserialize)]
        struct Document {
            text: String,
            #[serde(default)]
            meta: Option<Value>,
        }

        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| Error::file(path, e))?;
        let document: Document = serde_json::from_slice(&contents)?;
        self.load_document(&document.text, document.meta, project_id)
            .await
    }

    /// Loads every `*.json` search hit in `dir`, reading text from `_source.<text_field>`.
    #[instrument(skip(self))]
    pub async fn load_directory(
        &self,
        dir: &Path,
        text_field: &str,
        project_id: Option<u64>,
    ) -> Result<usize> {
        let project_id = self.project_id(project_id)?;
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::file(dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::file(dir, e))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let contents = tokio::fs::read(path)
                .await
                .map_err(|e| Error::file(path, e))?;
            let hit: Value = serde_json::from_slice(&contents)?;
            let text = hit["_source"][text_field].as_str().ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "{} has no string field _source.{text_field}",
                    path.display()
                ))
            })?;
            let meta = json!({ "source_id": hit["_id"], "source_index": hit["_index"] });
            self.load_document(text, Some(meta), Some(project_id))
                .await?;
        }
        info!("loaded {} documents into project {project_id}", paths.len());
        Ok(paths.len())
    }

    /// Streams `(text, labels)` for every example of the project, fetching pages on demand.
    ///
    /// Category ids missing from the project's label map come back as
    /// `unexpected label: <id>`.
    pub fn stream_labelled_samples(
        &self,
        project_id: Option<u64>,
    ) -> Result<impl Stream<Item = Result<LabelledSample>> + '_> {
        let state = SampleState {
            project_id: self.project_id(project_id)?,
            label_map: None,
            buffer: VecDeque::new(),
            next: None,
            started: false,
        };
        Ok(stream::try_unfold(state, move |state| self.next_sample(state)))
    }

    async fn next_sample(
        &self,
        mut state: SampleState,
    ) -> Result<Option<(LabelledSample, SampleState)>> {
        if state.label_map.is_none() {
            state.label_map = Some(self.label_map(state.project_id).await?);
        }

        loop {
            if let Some(example) = state.buffer.pop_front() {
                let url = self.url(&format!(
                    "projects/{}/examples/{}/categories",
                    state.project_id, example.id
                ));
                let categories: Vec<Category> = http::fetch_all(&self.client, &url).await?;
                let label_map = state.label_map.as_ref();
                let labels = categories
                    .iter()
                    .map(|category| {
                        label_map
                            .and_then(|map| map.get(&category.label).cloned())
                            .unwrap_or_else(|| format!("unexpected label: {}", category.label))
                    })
                    .collect();
                let sample = LabelledSample {
                    text: example.text,
                    labels,
                };
                return Ok(Some((sample, state)));
            }

            let url = if !state.started {
                state.started = true;
                self.url(&format!("projects/{}/examples", state.project_id))
            } else {
                match state.next.take() {
                    Some(url) => url,
                    None => return Ok(None),
                }
            };
            let (page, next) = http::fetch_page::<Example>(&self.client, &url).await?;
            state.buffer = page.into();
            state.next = next;
        }
    }

    /// Drains the labelled samples, writing them to `path` as JSON when given.
    #[instrument(skip(self))]
    pub async fn export_labelled_samples(
        &self,
        project_id: Option<u64>,
        path: Option<&Path>,
    ) -> Result<Vec<LabelledSample>> {
        let samples: Vec<LabelledSample> = self
            .stream_labelled_samples(project_id)?
            .try_collect()
            .await?;
        if let Some(path) = path {
            tokio::fs::write(path, serde_json::to_vec_pretty(&samples)?)
                .await
                .map_err(|e| Error::file(path, e))?;
            info!("exported {} samples to {}", samples.len(), path.display());
        }
        Ok(samples)
    }
}
