//! XML document model, serialization and path expressions.

mod document;
pub mod path;
mod serialize;

pub use document::{
    Attribute, Document, DocumentError, Element, NodeId, NodeKind, QName, XINCLUDE_NS, XML_NS,
};
pub use path::{CompiledPath, Item, Namespaces, NodeRef, PathError, Value, Variables};
