// Entity Models
// Typed records for the registries feeding the linkage engine.
//
// Every source schema is mapped into these types at the ingest boundary
// (see ingest.rs); the core never sees loosely-typed rows.

pub mod identifier;
pub mod record;
pub mod ownership;

pub use identifier::{Identifier, IdentifierKind};
pub use record::EntityRecord;
pub use ownership::{ConfidenceTier, OwnershipLink, RelationshipKind};
