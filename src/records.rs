//! Records for entities held by the training platform.
//!
//! `id` is `None` until the platform has confirmed the entity exists.

use serde::{Deserialize, Serialize};

/// Shared view used by name resolution.
pub trait Entity {
    /// Human readable kind, used in error messages.
    const KIND: &'static str;

    fn id(&self) -> Option<u64>;
    fn name(&self) -> Option<&str>;
}

macro_rules! entity {
    ($ty:ty, $kind:literal, $name:ident) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> Option<u64> {
                self.id
            }

            fn name(&self) -> Option<&str> {
                self.$name.as_deref()
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "original_file")]
    pub dataset_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptDb {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "cdb_file")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "vocab_file")]
    pub file: Option<String>,
}

/// A versioned archive bundling a concept DB and vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPack {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "model_pack")]
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTask {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The platform calls these relations and names them by `label`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTask {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, rename = "label")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
}

entity!(Dataset, "dataset", name);
entity!(ConceptDb, "concept db", name);
entity!(Vocabulary, "vocab", name);
entity!(ModelPack, "model pack", name);
entity!(MetaTask, "meta task", name);
entity!(RelationTask, "relation task", name);
entity!(User, "user", username);

macro_rules! with_id {
    ($($ty:ty),*) => {
        $(impl $ty {
            pub fn with_id(id: u64) -> Self {
                Self { id: Some(id), ..Default::default() }
            }
        })*
    };
}

with_id!(Dataset, ConceptDb, Vocabulary, ModelPack, MetaTask, RelationTask, User);

/// The aggregate that ties a dataset, a model and annotators together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Option<u64>,
    pub name: String,
    pub description: String,
    pub cuis: Vec<String>,
    pub dataset: Option<Dataset>,
    pub concept_db: Option<ConceptDb>,
    pub vocab: Option<Vocabulary>,
    pub model_pack: Option<ModelPack>,
    pub members: Vec<User>,
    pub meta_tasks: Vec<MetaTask>,
    pub rel_tasks: Vec<RelationTask>,
}

/// A reference given either by name or as an already known entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef<T> {
    Name(String),
    Entity(T),
}

impl<T> From<&str> for EntityRef<T> {
    fn from(name: &str) -> Self {
        EntityRef::Name(name.to_string())
    }
}

impl<T> From<String> for EntityRef<T> {
    fn from(name: String) -> Self {
        EntityRef::Name(name)
    }
}

macro_rules! entity_ref_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for EntityRef<$ty> {
            fn from(entity: $ty) -> Self {
                EntityRef::Entity(entity)
            }
        })*
    };
}

entity_ref_from!(Dataset, ConceptDb, Vocabulary, ModelPack, MetaTask, RelationTask, User);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relation_tasks_are_named_by_label() {
        let task: RelationTask =
            serde_json::from_value(json!({"id": 4, "label": "Spatial"})).unwrap();
        assert_eq!(task.name(), Some("Spatial"));
        assert_eq!(task.id(), Some(4));
    }

    #[test]
    fn listing_fields_map_onto_records() {
        let pack: ModelPack = serde_json::from_value(
            json!({"id": 2, "name": "snomed", "model_pack": "/media/snomed.zip", "extra": 1}),
        )
        .unwrap();
        assert_eq!(pack.archive.as_deref(), Some("/media/snomed.zip"));
    }

    #[test]
    fn refs_deserialize_from_names_or_records() {
        let refs: Vec<EntityRef<User>> =
            serde_json::from_value(json!(["admin", {"id": 3, "username": "ann"}])).unwrap();
        assert_eq!(refs[0], EntityRef::Name("admin".into()));
        assert_eq!(
            refs[1],
            EntityRef::Entity(User {
                id: Some(3),
                username: Some("ann".into())
            })
        );
    }
}
