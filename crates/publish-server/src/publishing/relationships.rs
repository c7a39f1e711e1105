//! Relationship graph
//!
//! Per entity type, which columns point at which other entity types. The graph
//! is plain data: the loader and the propagation engine iterate it generically,
//! so adding a table means adding a declaration here and a column in the schema.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PublishError;

/// Every table the bulk publisher knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Referent,
    Node,
    BibliographicCitation,
    Identifier,
    ScientificName,
    NodeAncestor,
    Vernacular,
    Article,
    Medium,
    Attribution,
    ImageInfo,
    Reference,
    ContentSection,
}

impl EntityType {
    pub const ALL: [EntityType; 13] = [
        EntityType::Referent,
        EntityType::Node,
        EntityType::BibliographicCitation,
        EntityType::Identifier,
        EntityType::ScientificName,
        EntityType::NodeAncestor,
        EntityType::Vernacular,
        EntityType::Article,
        EntityType::Medium,
        EntityType::Attribution,
        EntityType::ImageInfo,
        EntityType::Reference,
        EntityType::ContentSection,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            EntityType::Referent => "referents",
            EntityType::Node => "nodes",
            EntityType::BibliographicCitation => "bibliographic_citations",
            EntityType::Identifier => "identifiers",
            EntityType::ScientificName => "scientific_names",
            EntityType::NodeAncestor => "node_ancestors",
            EntityType::Vernacular => "vernaculars",
            EntityType::Article => "articles",
            EntityType::Medium => "media",
            EntityType::Attribution => "attributions",
            EntityType::ImageInfo => "image_info",
            EntityType::Reference => "references",
            EntityType::ContentSection => "content_sections",
        }
    }

    /// Name stored in polymorphic type columns (`parent_type`, `content_type`).
    pub fn class_name(self) -> &'static str {
        match self {
            EntityType::Referent => "Referent",
            EntityType::Node => "Node",
            EntityType::BibliographicCitation => "BibliographicCitation",
            EntityType::Identifier => "Identifier",
            EntityType::ScientificName => "ScientificName",
            EntityType::NodeAncestor => "NodeAncestor",
            EntityType::Vernacular => "Vernacular",
            EntityType::Article => "Article",
            EntityType::Medium => "Medium",
            EntityType::Attribution => "Attribution",
            EntityType::ImageInfo => "ImageInfo",
            EntityType::Reference => "Reference",
            EntityType::ContentSection => "ContentSection",
        }
    }

    /// Name of the harvester export for this table.
    pub fn file_name(self) -> String {
        format!("{}.tsv", self.table_name())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl FromStr for EntityType {
    type Err = PublishError;

    /// Accepts either the class name (`ScientificName`) or the table name
    /// (`scientific_names`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|e| e.table_name() == wanted || e.class_name().to_lowercase() == wanted)
            .ok_or_else(|| PublishError::UnsupportedEntity(s.to_string()))
    }
}

/// What a foreign-key column refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Single(EntityType),
    /// One column, several candidate tables. When `type_column` is set, each
    /// candidate only rewrites rows whose type column names that candidate.
    Polymorphic {
        candidates: &'static [EntityType],
        type_column: Option<&'static str>,
    },
}

impl Target {
    pub fn candidates(&self) -> &[EntityType] {
        match self {
            Target::Single(entity) => std::slice::from_ref(entity),
            Target::Polymorphic { candidates, .. } => candidates,
        }
    }

    pub fn type_column(&self) -> Option<&'static str> {
        match self {
            Target::Single(_) => None,
            Target::Polymorphic { type_column, .. } => *type_column,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub target: Target,
}

const fn fk(field: &'static str, entity: EntityType) -> ForeignKey {
    ForeignKey {
        field,
        target: Target::Single(entity),
    }
}

const fn poly(
    field: &'static str,
    candidates: &'static [EntityType],
    type_column: Option<&'static str>,
) -> ForeignKey {
    ForeignKey {
        field,
        target: Target::Polymorphic {
            candidates,
            type_column,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDecl {
    pub entity: EntityType,
    pub foreign_keys: &'static [ForeignKey],
    /// A missing export for a required table aborts the run.
    pub required: bool,
}

const fn decl(entity: EntityType, foreign_keys: &'static [ForeignKey]) -> EntityDecl {
    EntityDecl {
        entity,
        foreign_keys,
        required: false,
    }
}

use EntityType::*;

// Articles and media are not linked to nodes or pages here; that association
// is built afterwards by the content aggregator.
const STANDARD: &[EntityDecl] = &[
    decl(Referent, &[]),
    EntityDecl {
        entity: Node,
        foreign_keys: &[fk("parent_id", Node)],
        required: true,
    },
    decl(BibliographicCitation, &[]),
    decl(Identifier, &[fk("node_id", Node)]),
    decl(ScientificName, &[fk("node_id", Node)]),
    decl(NodeAncestor, &[fk("node_id", Node), fk("ancestor_id", Node)]),
    decl(Vernacular, &[fk("node_id", Node)]),
    decl(Article, &[fk("bibliographic_citation_id", BibliographicCitation)]),
    decl(Medium, &[fk("bibliographic_citation_id", BibliographicCitation)]),
    decl(
        Attribution,
        &[poly("content_id", &[Medium, Article], Some("content_type"))],
    ),
    decl(ImageInfo, &[fk("medium_id", Medium)]),
    // parent_id/parent_type are resolved by the reference pass instead.
    decl(Reference, &[fk("referent_id", Referent)]),
    decl(ContentSection, &[poly("content_id", &[Article], None)]),
];

/// Entity types that can own a `references` row (`parent_type`).
pub const REFERENCE_PARENT_TYPES: [EntityType; 4] = [Node, ScientificName, Medium, Article];

/// Ordered declaration of every loadable table and its foreign keys.
#[derive(Debug, Clone)]
pub struct RelationshipGraph {
    decls: Vec<EntityDecl>,
}

impl Default for RelationshipGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl RelationshipGraph {
    pub fn standard() -> Self {
        Self {
            decls: STANDARD.to_vec(),
        }
    }

    /// Build a graph from explicit declarations; the order is the load order.
    pub fn from_decls(decls: Vec<EntityDecl>) -> Result<Self, PublishError> {
        let graph = Self { decls };
        graph.validate_order()?;
        Ok(graph)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDecl> {
        self.decls.iter()
    }

    pub fn decl(&self, entity: EntityType) -> Option<&EntityDecl> {
        self.decls.iter().find(|d| d.entity == entity)
    }

    pub fn foreign_keys(&self, entity: EntityType) -> &[ForeignKey] {
        self.decl(entity).map(|d| d.foreign_keys).unwrap_or(&[])
    }

    /// Every referenced type must be loaded at or before the referencing one.
    pub fn validate_order(&self) -> Result<(), PublishError> {
        for (position, decl) in self.decls.iter().enumerate() {
            for key in decl.foreign_keys {
                for target in key.target.candidates() {
                    let loaded_before = self.decls[..=position]
                        .iter()
                        .any(|earlier| earlier.entity == *target);
                    if !loaded_before {
                        return Err(PublishError::UnsupportedEntity(format!(
                            "{}.{} references {} which is not loaded before it",
                            decl.entity, key.field, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
