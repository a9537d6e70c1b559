use std::path::{Path, PathBuf};

use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    multipart::{Form, Part},
    Client,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use crate::{
    config::TrainerConfig,
    error::{Error, Result},
    http,
    records::{
        ConceptDb, Dataset, Entity, EntityRef, MetaTask, ModelPack, Project, RelationTask, User,
        Vocabulary,
    },
    resolve,
};

const USERS: &str = "users";
const DATASETS: &str = "datasets";
const CONCEPT_DBS: &str = "concept-dbs";
const VOCABS: &str = "vocabs";
const MODEL_PACKS: &str = "modelpacks";
const META_TASKS: &str = "meta-tasks";
const RELATIONS: &str = "relations";
const PROJECTS: &str = "project-annotate-entities";
const DOWNLOAD_ANNOTATIONS: &str = "download-annos";

#[derive(Debug, Deserialize)]
struct Created {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ProjectEntry {
    id: u64,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    cuis: String,
    dataset: Option<u64>,
    concept_db: Option<u64>,
    vocab: Option<u64>,
    model_pack: Option<u64>,
    #[serde(default)]
    members: Vec<u64>,
    #[serde(default)]
    tasks: Vec<u64>,
    #[serde(default)]
    relations: Vec<u64>,
}

impl From<ProjectEntry> for Project {
    fn from(entry: ProjectEntry) -> Self {
        Project {
            id: Some(entry.id),
            name: entry.name,
            description: entry.description,
            cuis: split_cuis(&entry.cuis),
            dataset: entry.dataset.map(Dataset::with_id),
            concept_db: entry.concept_db.map(ConceptDb::with_id),
            vocab: entry.vocab.map(Vocabulary::with_id),
            model_pack: entry.model_pack.map(ModelPack::with_id),
            members: entry.members.into_iter().map(User::with_id).collect(),
            meta_tasks: entry.tasks.into_iter().map(MetaTask::with_id).collect(),
            rel_tasks: entry.relations.into_iter().map(RelationTask::with_id).collect(),
        }
    }
}

fn split_cuis(cuis: &str) -> Vec<String> {
    cuis.split(',')
        .map(str::trim)
        .filter(|cui| !cui.is_empty())
        .map(String::from)
        .collect()
}

/// A project creation request. Every reference may be a name or a known entity.
///
/// Exactly one of a `concept_db` + `vocab` pair or a `model_pack` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: Vec<EntityRef<User>>,
    pub dataset: EntityRef<Dataset>,
    #[serde(default)]
    pub cuis: Vec<String>,
    /// Extra CUI filter uploaded as a file alongside `cuis`.
    #[serde(default)]
    pub cuis_file: Option<PathBuf>,
    #[serde(default)]
    pub concept_db: Option<EntityRef<ConceptDb>>,
    #[serde(default)]
    pub vocab: Option<EntityRef<Vocabulary>>,
    #[serde(default)]
    pub cdb_search_filter: Option<EntityRef<ConceptDb>>,
    #[serde(default)]
    pub model_pack: Option<EntityRef<ModelPack>>,
    #[serde(default)]
    pub meta_tasks: Vec<EntityRef<MetaTask>>,
    #[serde(default)]
    pub rel_tasks: Vec<EntityRef<RelationTask>>,
}

impl NewProject {
    pub fn new(name: impl Into<String>, dataset: impl Into<EntityRef<Dataset>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            members: Vec::new(),
            dataset: dataset.into(),
            cuis: Vec::new(),
            cuis_file: None,
            concept_db: None,
            vocab: None,
            cdb_search_filter: None,
            model_pack: None,
            meta_tasks: Vec::new(),
            rel_tasks: Vec::new(),
        }
    }

    fn check_model_selection(&self) -> Result<()> {
        let pair = (self.concept_db.is_some(), self.vocab.is_some());
        match (pair, self.model_pack.is_some()) {
            ((true, _) | (_, true), true) => Err(Error::InvalidArgument(
                "cannot specify both concept_db/vocab and model_pack".into(),
            )),
            ((true, true), false) | ((false, false), true) => Ok(()),
            ((false, false), false) => Err(Error::InvalidArgument(
                "either a concept_db and vocab pair or a model_pack is required".into(),
            )),
            _ => Err(Error::InvalidArgument(
                "concept_db and vocab must be given together".into(),
            )),
        }
    }
}

fn id_of<T: Entity>(entity: &T) -> Result<u64> {
    entity.id().ok_or_else(|| {
        Error::IncompleteReference(format!(
            "{} {} has no id",
            T::KIND,
            entity.name().unwrap_or("<unnamed>")
        ))
    })
}

async fn file_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::file(path, e))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok(Part::bytes(bytes).file_name(file_name))
}

fn local_file<'a>(file: &'a Option<String>, kind: &str) -> Result<&'a Path> {
    file.as_deref()
        .map(Path::new)
        .ok_or_else(|| Error::InvalidArgument(format!("{kind} has no file to upload")))
}

/// A token authenticated session with the concept annotation training platform.
pub struct TrainerClient {
    server: String,
    client: Client,
}

impl TrainerClient {
    /// Exchanges the credentials for an api token.
    #[instrument(skip_all, fields(server = %config.server))]
    pub async fn connect(config: &TrainerConfig) -> Result<Self> {
        #[derive(Deserialize)]
        struct Token {
            token: String,
        }

        let server = config.server.trim_end_matches('/').to_string();
        let login = http::build_client(&config.transport, HeaderMap::new())?;
        let resp = login
            .post(format!("{server}/api/api-token-auth/"))
            .json(&json!({ "username": config.username, "password": config.password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Authentication {
                reason: format!("failed to login to training platform instance running at {server}"),
                server,
            });
        }
        let Token { token } = resp.json().await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Token {token}"))
                .map_err(|_| Error::Config("api token contains invalid characters".into()))?,
        );
        info!("logged in as {}", config.username);

        Ok(Self {
            client: http::build_client(&config.transport, headers)?,
            server,
        })
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/api/{}/", self.server, collection)
    }

    async fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        http::fetch_all(&self.client, &self.url(collection)).await
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        self.list(USERS).await
    }

    pub async fn get_datasets(&self) -> Result<Vec<Dataset>> {
        self.list(DATASETS).await
    }

    pub async fn get_concept_dbs(&self) -> Result<Vec<ConceptDb>> {
        self.list(CONCEPT_DBS).await
    }

    pub async fn get_vocabs(&self) -> Result<Vec<Vocabulary>> {
        self.list(VOCABS).await
    }

    /// Concept DBs and vocabularies together.
    pub async fn get_models(&self) -> Result<(Vec<ConceptDb>, Vec<Vocabulary>)> {
        Ok((self.get_concept_dbs().await?, self.get_vocabs().await?))
    }

    pub async fn get_model_packs(&self) -> Result<Vec<ModelPack>> {
        self.list(MODEL_PACKS).await
    }

    pub async fn get_meta_tasks(&self) -> Result<Vec<MetaTask>> {
        self.list(META_TASKS).await
    }

    pub async fn get_rel_tasks(&self) -> Result<Vec<RelationTask>> {
        self.list(RELATIONS).await
    }

    /// Projects as listed by the platform; references carry ids only.
    pub async fn get_projects(&self) -> Result<Vec<Project>> {
        let entries: Vec<ProjectEntry> = self.list(PROJECTS).await?;
        Ok(entries.into_iter().map(Project::from).collect())
    }

    async fn upload(&self, collection: &str, name: &str, field: &'static str, path: &Path) -> Result<u64> {
        let form = Form::new()
            .text("name", name.to_string())
            .part(field, file_part(path).await?);
        let created: Created =
            http::read_json(self.client.post(self.url(collection)).multipart(form).send().await?)
                .await?;
        info!("uploaded {} to {collection} as {}", path.display(), created.id);
        Ok(created.id)
    }

    #[instrument(skip(self))]
    pub async fn create_dataset(&self, name: &str, dataset_file: &Path) -> Result<Dataset> {
        let id = self.upload(DATASETS, name, "original_file", dataset_file).await?;
        Ok(Dataset {
            id: Some(id),
            name: Some(name.to_string()),
            dataset_file: Some(dataset_file.display().to_string()),
        })
    }

    #[instrument(skip(self, password))]
    pub async fn create_user(&self, username: &str, password: &str) -> Result<User> {
        let created: Created = http::read_json(
            self.client
                .post(self.url(USERS))
                .json(&json!({ "username": username, "password": password }))
                .send()
                .await?,
        )
        .await?;
        Ok(User {
            id: Some(created.id),
            username: Some(username.to_string()),
        })
    }

    /// Uploads the concept DB file named by `cdb.file`.
    pub async fn create_concept_db(&self, cdb: ConceptDb) -> Result<ConceptDb> {
        let name = cdb.name.clone().unwrap_or_default();
        let id = self
            .upload(CONCEPT_DBS, &name, "cdb_file", local_file(&cdb.file, ConceptDb::KIND)?)
            .await?;
        Ok(ConceptDb { id: Some(id), ..cdb })
    }

    /// Uploads the vocabulary file named by `vocab.file`.
    pub async fn create_vocab(&self, vocab: Vocabulary) -> Result<Vocabulary> {
        let name = vocab.name.clone().unwrap_or_default();
        let id = self
            .upload(VOCABS, &name, "vocab_file", local_file(&vocab.file, Vocabulary::KIND)?)
            .await?;
        Ok(Vocabulary { id: Some(id), ..vocab })
    }

    /// Uploads a concept DB and vocabulary pair.
    pub async fn create_medcat_model(
        &self,
        cdb: ConceptDb,
        vocab: Vocabulary,
    ) -> Result<(ConceptDb, Vocabulary)> {
        let cdb = self.create_concept_db(cdb).await?;
        let vocab = self.create_vocab(vocab).await?;
        Ok((cdb, vocab))
    }

    pub async fn create_model_pack(&self, model_pack: ModelPack) -> Result<ModelPack> {
        let name = model_pack.name.clone().unwrap_or_default();
        let id = self
            .upload(
                MODEL_PACKS,
                &name,
                "model_pack",
                local_file(&model_pack.archive, ModelPack::KIND)?,
            )
            .await?;
        Ok(ModelPack {
            id: Some(id),
            ..model_pack
        })
    }

    async fn resolve_one<T>(&self, reference: EntityRef<T>, collection: &str) -> Result<T>
    where
        T: Entity + Clone + DeserializeOwned,
    {
        match reference {
            EntityRef::Entity(entity) => resolve::require_id(entity),
            EntityRef::Name(name) => resolve::select_one(&name, &self.list::<T>(collection).await?),
        }
    }

    async fn resolve_optional<T>(
        &self,
        reference: Option<EntityRef<T>>,
        collection: &str,
    ) -> Result<Option<T>>
    where
        T: Entity + Clone + DeserializeOwned,
    {
        match reference {
            Some(reference) => Ok(Some(self.resolve_one(reference, collection).await?)),
            None => Ok(None),
        }
    }

    async fn resolve_many<T>(&self, refs: Vec<EntityRef<T>>, collection: &str) -> Result<Vec<T>>
    where
        T: Entity + Clone + DeserializeOwned,
    {
        let names = resolve::names(&refs);
        let resolved = if names.is_empty() {
            Vec::new()
        } else {
            resolve::select_all(&names, &self.list::<T>(collection).await?)?
        };
        resolve::merge(refs, resolved)
    }

    /// Resolves every named reference and creates the project.
    ///
    /// The returned project carries the resolved entities and the id assigned
    /// by the platform.
    #[instrument(skip_all, fields(name = %request.name))]
    pub async fn create_project(&self, request: NewProject) -> Result<Project> {
        request.check_model_selection()?;
        let cuis_file = match &request.cuis_file {
            Some(path) => Some(file_part(path).await?),
            None => None,
        };

        let members = self.resolve_many(request.members, USERS).await?;
        let dataset = self.resolve_one(request.dataset, DATASETS).await?;
        let concept_db = self.resolve_optional(request.concept_db, CONCEPT_DBS).await?;
        let vocab = self.resolve_optional(request.vocab, VOCABS).await?;
        let cdb_search_filter = self
            .resolve_optional(request.cdb_search_filter, CONCEPT_DBS)
            .await?;
        let model_pack = self.resolve_optional(request.model_pack, MODEL_PACKS).await?;
        let meta_tasks = self.resolve_many(request.meta_tasks, META_TASKS).await?;
        let rel_tasks = self.resolve_many(request.rel_tasks, RELATIONS).await?;

        let mut form = Form::new()
            .text("name", request.name.clone())
            .text("description", request.description.clone())
            .text("cuis", request.cuis.join(","))
            .text("dataset", id_of(&dataset)?.to_string());
        let optional = [
            ("concept_db", concept_db.as_ref().map(id_of).transpose()?),
            ("vocab", vocab.as_ref().map(id_of).transpose()?),
            ("model_pack", model_pack.as_ref().map(id_of).transpose()?),
            (
                "cdb_search_filter",
                cdb_search_filter.as_ref().map(id_of).transpose()?,
            ),
        ];
        for (field, id) in optional {
            if let Some(id) = id {
                form = form.text(field, id.to_string());
            }
        }
        for member in &members {
            form = form.text("members", id_of(member)?.to_string());
        }
        for task in &meta_tasks {
            form = form.text("tasks", id_of(task)?.to_string());
        }
        for task in &rel_tasks {
            form = form.text("relations", id_of(task)?.to_string());
        }
        if let Some(part) = cuis_file {
            form = form.part("cuis_file", part);
        }

        let resp = self.client.post(self.url(PROJECTS)).multipart(form).send().await?;
        let created: Created = http::read_json(resp).await.map_err(|e| {
            error!("failed to create project with name {}: {e}", request.name);
            e
        })?;
        info!("created project {} ({})", request.name, created.id);

        Ok(Project {
            id: Some(created.id),
            name: request.name,
            description: request.description,
            cuis: request.cuis,
            dataset: Some(dataset),
            concept_db,
            vocab,
            model_pack,
            members,
            meta_tasks,
            rel_tasks,
        })
    }

    /// Downloads the annotations of every project, with document text inline.
    #[instrument(skip_all, fields(projects = projects.len()))]
    pub async fn get_project_annotations(&self, projects: &[Project]) -> Result<Value> {
        let ids = projects
            .iter()
            .map(|p| {
                p.id.map(|id| id.to_string()).ok_or_else(|| {
                    Error::IncompleteReference(format!(
                        "project {} has no id; every project needs one to download annotations",
                        p.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let resp = self
            .client
            .get(self.url(DOWNLOAD_ANNOTATIONS))
            .query(&[("project_ids", ids.join(",").as_str()), ("with_text", "1")])
            .send()
            .await?;
        http::read_json(resp).await
    }
}
