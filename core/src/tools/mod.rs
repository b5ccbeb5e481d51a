//! Tool surface: declarative schemas, a name-keyed registry and the
//! built-in capability set.

pub mod builtin;
pub mod error;
pub mod registry;
pub mod schema;

pub use builtin::{
    CannedJurisprudence, DocumentAnalyseTool, FormatCitationTool, JurisprudenceProvider,
    JurisprudenceSearchTool, Precedent, QualityScoreTool, RetrieveTool,
};
pub use error::{ToolError, ToolResult};
pub use registry::{Tool, ToolRegistry};
pub use schema::{ParamKind, ParamSpec, ToolSchema};
