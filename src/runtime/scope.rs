//! Run-time name resolution for binding expressions.
//!
//! A [`DynamicScope`] is a borrowed view built for one evaluation and
//! dropped afterwards; it never owns the mappings it searches.

use std::rc::Rc;

use thiserror::Error;

use crate::runtime::machine::Machine;
use crate::runtime::runtime_error::{attribute_error, type_error, RuntimeError};
use crate::runtime::value::{DictRef, HostObject, Kwargs, Value};

pub const BUILTINS_NAME: &str = "__builtins__";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("name '{name}' is not defined")]
    NotFound { name: String },
    #[error("scope level {level} is beyond the root of the object chain")]
    LevelOutOfRange { level: usize },
}

/// Name storage consulted by `LOAD_NAME`, `STORE_NAME` and `DELETE_NAME`.
pub trait Namespace {
    fn resolve(&self, name: &str) -> Result<Value, ResolutionError>;
    fn define(&mut self, name: &str, value: Value);
    fn contains(&self, name: &str) -> bool;
    fn remove(&mut self, name: &str) -> Result<(), ResolutionError>;
}

/// Observer of names that resolved through the object chain.
pub trait ScopeListener {
    fn dynamic_load(&self, owner: &Rc<dyn HostObject>, name: &str, value: &Value);
}

pub struct DynamicScope<'a> {
    owner: &'a Rc<dyn HostObject>,
    overrides: &'a DictRef,
    locals: &'a DictRef,
    globals: &'a DictRef,
    listener: Option<Rc<dyn ScopeListener>>,
    change: Option<Value>,
}

impl<'a> DynamicScope<'a> {
    pub fn new(owner: &'a Rc<dyn HostObject>, overrides: &'a DictRef, locals: &'a DictRef, globals: &'a DictRef) -> Self {
        Self {
            owner,
            overrides,
            locals,
            globals,
            listener: None,
            change: None,
        }
    }

    pub fn with_listener(mut self, listener: Rc<dyn ScopeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Makes `change` resolvable, as inside an event handler.
    pub fn with_change(mut self, change: Value) -> Self {
        self.change = Some(change);
        self
    }

    fn magic(&self, name: &str) -> Option<Value> {
        match name {
            "self" => Some(Value::Object(self.owner.clone())),
            "nonlocals" => Some(Value::object(Nonlocals::new(self.owner.clone(), self.listener.clone()))),
            "change" => self.change.clone(),
            _ => None,
        }
    }

    fn builtin(&self, name: &str) -> Option<Value> {
        let globals = self.globals.borrow();
        match globals.get_str(BUILTINS_NAME) {
            Some(Value::Dict(builtins)) => builtins.borrow().get_str(name).cloned(),
            _ => None,
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.overrides.borrow().get_str(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.magic(name) {
            return Some(value);
        }
        if let Some(value) = self.locals.borrow().get_str(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.globals.borrow().get_str(name) {
            return Some(value.clone());
        }
        self.builtin(name)
    }
}

impl Namespace for DynamicScope<'_> {
    fn resolve(&self, name: &str) -> Result<Value, ResolutionError> {
        if let Some(value) = self.lookup(name) {
            return Ok(value);
        }
        let (holder, value) = walk_chain(self.owner.clone(), name).ok_or_else(|| ResolutionError::NotFound {
            name: name.to_string(),
        })?;
        if let Some(listener) = &self.listener {
            listener.dynamic_load(&holder, name, &value);
        }
        Ok(value)
    }

    fn define(&mut self, name: &str, value: Value) {
        self.locals.borrow_mut().set_str(name, value);
    }

    fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some() || walk_chain(self.owner.clone(), name).is_some()
    }

    fn remove(&mut self, name: &str) -> Result<(), ResolutionError> {
        self.locals
            .borrow_mut()
            .remove(&Value::str(name))
            .map(|_| ())
            .ok_or_else(|| ResolutionError::NotFound { name: name.to_string() })
    }
}

/// First object in the chain starting at `start` that answers `name`.
fn walk_chain(start: Rc<dyn HostObject>, name: &str) -> Option<(Rc<dyn HostObject>, Value)> {
    let mut current = Some(start);
    while let Some(object) = current {
        if let Some(value) = object.get_attr(name) {
            return Some((object, value));
        }
        current = object.parent();
    }
    None
}

/// Explicit access to the object chain, skipping locals and globals.
///
/// Reads and writes go to the first ancestor (at or above the selected
/// level) that has the attribute. Calling the object with an integer
/// selects a higher starting level.
#[derive(Clone)]
pub struct Nonlocals {
    owner: Rc<dyn HostObject>,
    listener: Option<Rc<dyn ScopeListener>>,
}

impl std::fmt::Debug for Nonlocals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nonlocals").field("owner", &self.owner).finish()
    }
}

impl Nonlocals {
    pub fn new(owner: Rc<dyn HostObject>, listener: Option<Rc<dyn ScopeListener>>) -> Self {
        Self { owner, listener }
    }

    /// A view starting `level` parents above the owner.
    pub fn at_level(&self, level: usize) -> Result<Nonlocals, ResolutionError> {
        let mut owner = self.owner.clone();
        for _ in 0..level {
            owner = owner.parent().ok_or(ResolutionError::LevelOutOfRange { level })?;
        }
        Ok(Nonlocals {
            owner,
            listener: self.listener.clone(),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<Value, ResolutionError> {
        let (holder, value) = walk_chain(self.owner.clone(), name).ok_or_else(|| ResolutionError::NotFound {
            name: name.to_string(),
        })?;
        if let Some(listener) = &self.listener {
            listener.dynamic_load(&holder, name, &value);
        }
        Ok(value)
    }

    pub fn assign(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let (holder, _) = walk_chain(self.owner.clone(), name).ok_or_else(|| attribute_error("nonlocals", name))?;
        holder.set_attr(name, value)
    }
}

impl HostObject for Nonlocals {
    fn type_name(&self) -> &str {
        "nonlocals"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        self.resolve(name).ok()
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.assign(name, value)
    }

    fn call(&self, _machine: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
        let level = match (args.as_slice(), kwargs.is_empty()) {
            ([], true) => 0,
            ([level], true) => level
                .as_int()
                .filter(|l| *l >= 0)
                .ok_or_else(|| type_error("nonlocals level must be a non-negative int"))?,
            _ => return Err(type_error("nonlocals() takes at most 1 argument")),
        };
        Ok(Value::object(self.at_level(level as usize)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Dict;
    use std::cell::RefCell;

    #[derive(Debug)]
    struct Node {
        attrs: RefCell<Dict>,
        parent: Option<Rc<dyn HostObject>>,
    }

    impl Node {
        fn new(attrs: &[(&str, i64)], parent: Option<Rc<dyn HostObject>>) -> Rc<dyn HostObject> {
            let dict = attrs.iter().map(|(k, v)| (Value::str(*k), Value::Int(*v))).collect();
            Rc::new(Node {
                attrs: RefCell::new(dict),
                parent,
            })
        }
    }

    impl HostObject for Node {
        fn type_name(&self) -> &str {
            "Node"
        }

        fn get_attr(&self, name: &str) -> Option<Value> {
            self.attrs.borrow().get_str(name).cloned()
        }

        fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
            self.attrs.borrow_mut().set_str(name, value);
            Ok(())
        }

        fn parent(&self) -> Option<Rc<dyn HostObject>> {
            self.parent.clone()
        }
    }

    #[derive(Default)]
    struct Recorder {
        loads: RefCell<Vec<String>>,
    }

    impl ScopeListener for Recorder {
        fn dynamic_load(&self, owner: &Rc<dyn HostObject>, name: &str, value: &Value) {
            self.loads.borrow_mut().push(format!("{}.{}={}", owner.type_name(), name, value));
        }
    }

    fn dict(entries: &[(&str, i64)]) -> DictRef {
        entries
            .iter()
            .map(|(k, v)| (Value::str(*k), Value::Int(*v)))
            .collect::<Dict>()
            .shared()
    }

    fn int(value: Result<Value, ResolutionError>) -> i64 {
        value.unwrap().as_int().unwrap()
    }

    #[test]
    fn test_resolution_precedence() {
        let root = Node::new(&[("w", 7)], None);
        let owner = Node::new(&[("z", 6)], Some(root));
        let overrides = dict(&[("x", 1)]);
        let locals = dict(&[("x", 2), ("y", 3)]);
        let globals = dict(&[("y", 4), ("z", 5)]);
        let scope = DynamicScope::new(&owner, &overrides, &locals, &globals);

        assert_eq!(int(scope.resolve("x")), 1);
        assert_eq!(int(scope.resolve("y")), 3);
        assert_eq!(int(scope.resolve("z")), 5);
        assert_eq!(int(scope.resolve("w")), 7);
        assert!(matches!(
            scope.resolve("missing"),
            Err(ResolutionError::NotFound { name }) if name == "missing"
        ));
    }

    #[test]
    fn test_builtins_come_after_globals() {
        let owner = Node::new(&[("len", 0)], None);
        let empty = dict(&[]);
        let globals = dict(&[]);
        globals
            .borrow_mut()
            .set_str(BUILTINS_NAME, Value::Dict(dict(&[("len", 42)])));
        let scope = DynamicScope::new(&owner, &empty, &empty, &globals);
        assert_eq!(int(scope.resolve("len")), 42);
    }

    #[test]
    fn test_listener_sees_only_chain_loads() {
        let root = Node::new(&[("w", 7)], None);
        let owner = Node::new(&[], Some(root));
        let empty = dict(&[]);
        let globals = dict(&[("g", 1)]);
        let recorder = Rc::new(Recorder::default());
        let scope = DynamicScope::new(&owner, &empty, &empty, &globals).with_listener(recorder.clone());

        scope.resolve("g").unwrap();
        scope.resolve("w").unwrap();
        assert!(scope.contains("w"));
        assert!(!scope.contains("nope"));
        assert_eq!(*recorder.loads.borrow(), vec!["Node.w=7"]);
    }

    #[test]
    fn test_define_and_remove_touch_locals() {
        let owner = Node::new(&[], None);
        let empty = dict(&[]);
        let locals = dict(&[]);
        let mut scope = DynamicScope::new(&owner, &empty, &locals, &empty);
        scope.define("tmp", Value::Int(3));
        assert_eq!(int(scope.resolve("tmp")), 3);
        scope.remove("tmp").unwrap();
        assert!(scope.remove("tmp").is_err());
        assert!(locals.borrow().is_empty());
    }

    #[test]
    fn test_magic_names() {
        let owner = Node::new(&[], None);
        let empty = dict(&[]);
        let scope = DynamicScope::new(&owner, &empty, &empty, &empty).with_change(Value::str("evt"));
        assert!(matches!(scope.resolve("self"), Ok(Value::Object(o)) if Rc::ptr_eq(&o, &owner)));
        assert_eq!(scope.resolve("change").unwrap().to_string(), "evt");
        assert!(matches!(scope.resolve("nonlocals"), Ok(Value::Object(_))));

        let plain = DynamicScope::new(&owner, &empty, &empty, &empty);
        assert!(!plain.contains("change"));
    }

    #[test]
    fn test_nonlocals_walks_levels() {
        let root = Node::new(&[("title", 1)], None);
        let middle = Node::new(&[("title", 2)], Some(root.clone()));
        let owner = Node::new(&[], Some(middle));
        let nonlocals = Nonlocals::new(owner, None);

        assert_eq!(int(nonlocals.resolve("title")), 2);
        assert_eq!(int(nonlocals.at_level(2).unwrap().resolve("title")), 1);
        assert_eq!(
            nonlocals.at_level(3).unwrap_err(),
            ResolutionError::LevelOutOfRange { level: 3 }
        );

        nonlocals.at_level(2).unwrap().assign("title", Value::Int(9)).unwrap();
        assert_eq!(root.get_attr("title").and_then(|v| v.as_int()), Some(9));
        assert!(nonlocals.assign("absent", Value::None).is_err());
    }
}
