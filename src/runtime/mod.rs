pub mod builtins;
pub mod exception;
pub mod host;
pub mod machine;
pub mod ops;
pub mod runtime_error;
pub mod scope;
pub mod value;

pub use exception::{ExcType, ExceptionKind, ExceptionValue, TraceEntry};
pub use host::AttrObject;
pub use machine::{Machine, MachineConfig};
pub use runtime_error::RuntimeError;
pub use scope::{DynamicScope, Namespace, Nonlocals, ResolutionError, ScopeListener, BUILTINS_NAME};
pub use value::{Dict, DictRef, Function, HostObject, Kwargs, Value};
