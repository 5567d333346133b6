//! A ready-made host object for embedders.

use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::machine::Machine;
use crate::runtime::runtime_error::{attribute_error, RuntimeError};
use crate::runtime::value::{Dict, HostObject, Kwargs, Value};

/// An object whose attributes live in a plain ordered map.
///
/// Good enough for helper tables and simple node objects; anything with
/// behaviour on attribute access should implement [`HostObject`] itself.
#[derive(Debug)]
pub struct AttrObject {
    type_name: String,
    attrs: RefCell<Dict>,
    parent: Option<Rc<dyn HostObject>>,
}

impl AttrObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attrs: RefCell::new(Dict::new()),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: Rc<dyn HostObject>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_attr(self, name: &str, value: Value) -> Self {
        self.attrs.borrow_mut().set_str(name, value);
        self
    }

    /// Adds a native method under `name`.
    pub fn with_native(
        self,
        name: &str,
        func: impl Fn(&mut Machine, Vec<Value>, Kwargs) -> Result<Value, RuntimeError> + 'static,
    ) -> Self {
        let native = Value::native(name, func);
        self.with_attr(name, native)
    }

    pub fn into_rc(self) -> Rc<dyn HostObject> {
        Rc::new(self)
    }
}

impl HostObject for AttrObject {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get_str(name).cloned()
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.attrs.borrow_mut().set_str(name, value);
        Ok(())
    }

    fn del_attr(&self, name: &str) -> Result<(), RuntimeError> {
        self.attrs
            .borrow_mut()
            .remove(&Value::str(name))
            .map(|_| ())
            .ok_or_else(|| attribute_error(&self.type_name, name))
    }

    fn parent(&self) -> Option<Rc<dyn HostObject>> {
        self.parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_and_parent() {
        let root = AttrObject::new("Window").with_attr("title", Value::str("main")).into_rc();
        let child = AttrObject::new("Label").with_parent(root.clone());
        child.set_attr("text", Value::str("hi")).unwrap();
        assert_eq!(child.get_attr("text").unwrap().to_string(), "hi");
        assert!(child.get_attr("title").is_none());
        assert_eq!(child.parent().unwrap().type_name(), "Window");
        child.del_attr("text").unwrap();
        assert!(child.del_attr("text").is_err());
    }
}
