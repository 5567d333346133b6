//! Compiles whole definitions and runs them against a small in-test host
//! runtime that implements the helper table.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Context, Result};

use kindle::compiler::{CompiledItem, Compiler, HELPERS_GLOBAL};
use kindle::runtime::runtime_error::type_error;
use kindle::runtime::{
    AttrObject, Dict, DictRef, DynamicScope, ExceptionKind, HostObject, Machine, RuntimeError, Value,
};

/// A construct node. `children.append` links the parent chain.
#[derive(Debug)]
struct Node {
    type_name: String,
    /// creation order, which matches the layout index within one build
    ordinal: usize,
    ident: Option<String>,
    attrs: RefCell<Dict>,
    parent: RefCell<Option<Rc<dyn HostObject>>>,
    me: Weak<Node>,
}

impl Node {
    fn create(type_name: &str, ordinal: usize, ident: Option<String>) -> Rc<Node> {
        Rc::new_cyclic(|me| Node {
            type_name: type_name.to_string(),
            ordinal,
            ident,
            attrs: RefCell::new(Dict::new()),
            parent: RefCell::new(None),
            me: me.clone(),
        })
    }
}

impl HostObject for Node {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        if name == "children" {
            let owner: Rc<dyn HostObject> = self.me.upgrade()?;
            return Some(Value::object(Children { owner }));
        }
        self.attrs.borrow().get_str(name).cloned()
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.attrs.borrow_mut().set_str(name, value);
        Ok(())
    }

    fn parent(&self) -> Option<Rc<dyn HostObject>> {
        self.parent.borrow().clone()
    }
}

#[derive(Debug)]
struct Children {
    owner: Rc<dyn HostObject>,
}

impl HostObject for Children {
    fn type_name(&self) -> &str {
        "children"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        if name != "append" {
            return None;
        }
        let owner = self.owner.clone();
        Some(Value::native("append", move |_, args, _| {
            let Some(Value::Object(child)) = args.first() else {
                return Err(type_error("children.append expects a node"));
            };
            if let Some(node) = registered(child) {
                *node.parent.borrow_mut() = Some(owner.clone());
            }
            Ok(Value::None)
        }))
    }
}

thread_local! {
    static REGISTRY: RefCell<Vec<Rc<Node>>> = const { RefCell::new(Vec::new()) };
    static CALLS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn new_node(type_name: &str, ident: Option<String>) -> Value {
    REGISTRY.with(|nodes| {
        let mut nodes = nodes.borrow_mut();
        let node = Node::create(type_name, nodes.len(), ident);
        nodes.push(node.clone());
        Value::Object(node)
    })
}

fn registered(object: &Rc<dyn HostObject>) -> Option<Rc<Node>> {
    REGISTRY.with(|nodes| {
        nodes
            .borrow()
            .iter()
            .find(|node| std::ptr::addr_eq(Rc::as_ptr(*node), Rc::as_ptr(object)))
            .cloned()
    })
}

fn by_ident(ident: &str) -> Option<Rc<Node>> {
    REGISTRY.with(|nodes| nodes.borrow().iter().find(|node| node.ident.as_deref() == Some(ident)).cloned())
}

/// Logs `helper index detail` for the node a helper was handed.
fn record(helper: &str, node: &Rc<dyn HostObject>, detail: &str) {
    let index = registered(node).map_or(usize::MAX, |node| node.ordinal);
    CALLS.with(|calls| calls.borrow_mut().push(format!("{} {} {}", helper, index, detail)));
}

fn recorded() -> Vec<String> {
    CALLS.with(|calls| calls.borrow().clone())
}

fn opt_str(args: &[Value], index: usize) -> Option<String> {
    args.get(index).and_then(|v| v.as_str().map(str::to_string))
}

fn str_tuple(args: &[Value], index: usize) -> Result<Vec<String>, RuntimeError> {
    match args.get(index) {
        Some(Value::Tuple(items)) => Ok(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        _ => Err(type_error(format!("argument {} must be a tuple", index))),
    }
}

fn arg_str(args: &[Value], index: usize) -> Result<String, RuntimeError> {
    args.get(index)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| type_error(format!("argument {} must be a str", index)))
}

fn object_arg(args: &[Value], index: usize) -> Result<Rc<dyn HostObject>, RuntimeError> {
    match args.get(index) {
        Some(Value::Object(object)) => Ok(object.clone()),
        _ => Err(type_error(format!("argument {} must be a node", index))),
    }
}

fn dict_arg(args: &[Value], index: usize) -> DictRef {
    match args.get(index) {
        Some(Value::Dict(dict)) => dict.clone(),
        _ => Dict::new().shared(),
    }
}

/// Evaluates a read unit with `node` as the scope owner.
fn evaluate(machine: &mut Machine, node: &Rc<dyn HostObject>, read: Option<&Value>, globals: &DictRef, locals: &DictRef) -> Result<Option<Value>, RuntimeError> {
    let Some(Value::Code(read)) = read else {
        return Ok(None);
    };
    let overrides = Dict::new().shared();
    let mut scope = DynamicScope::new(node, &overrides, locals, globals);
    machine.eval(read, globals, &mut scope).map(Some)
}

/// `(node, name, op, read, write, globals, scope)`: stores the value on the node.
fn run_operator(machine: &mut Machine, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let node = object_arg(&args, 0)?;
    let name = arg_str(&args, 1)?;
    record("run_operator", &node, &name);
    if let Some(value) = evaluate(machine, &node, args.get(3), &dict_arg(&args, 5), &dict_arg(&args, 6))? {
        node.set_attr(&name, value)?;
    }
    Ok(Value::None)
}

/// `(node, chain, op, read, write, globals, scope)`: the first link names
/// an identified node, the last one the attribute set on it.
fn run_chained_operator(machine: &mut Machine, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let node = object_arg(&args, 0)?;
    let chain = str_tuple(&args, 1)?;
    record("run_chained_operator", &node, &chain.join("."));
    let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
        return Err(type_error("empty attribute chain"));
    };
    let target = by_ident(first).ok_or_else(|| type_error(format!("no node named '{}'", first)))?;
    if let Some(value) = evaluate(machine, &node, args.get(3), &dict_arg(&args, 5), &dict_arg(&args, 6))? {
        target.set_attr(last, value)?;
    }
    Ok(Value::None)
}

/// `(node, identifier, chain, op, read, write, globals, scope)`: stored on
/// the instance node under `identifier.chain`.
fn run_template_operator(machine: &mut Machine, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let node = object_arg(&args, 0)?;
    let mut path = vec![arg_str(&args, 1)?];
    path.extend(str_tuple(&args, 2)?);
    let key = path.join(".");
    record("run_template_operator", &node, &key);
    if let Some(value) = evaluate(machine, &node, args.get(4), &dict_arg(&args, 6), &dict_arg(&args, 7))? {
        node.set_attr(&key, value)?;
    }
    Ok(Value::None)
}

fn helper_table() -> Value {
    let table = AttrObject::new("helpers")
        .with_native("validate_declarative", |_, args, _| Ok(args.into_iter().next().unwrap_or(Value::None)))
        .with_native("validate_template", |_, args, _| Ok(args.into_iter().next().unwrap_or(Value::None)))
        .with_native("validate_const", |_, args, _| Ok(args.get(1).cloned().unwrap_or(Value::None)))
        .with_native("make_object_node", |_, args, _| Ok(new_node(&arg_str(&args, 1)?, opt_str(&args, 2))))
        .with_native("make_child_node", |_, args, _| {
            let base = object_arg(&args, 0)?;
            Ok(new_node(base.type_name(), opt_str(&args, 1)))
        })
        .with_native("make_template_node", |_, _, _| Ok(new_node("template", None)))
        .with_native("make_template_inst_node", |_, args, _| {
            let base = object_arg(&args, 0)?;
            let node = new_node(base.type_name(), None);
            if let Value::Object(object) = &node {
                object.set_attr("args", args.get(1).cloned().unwrap_or(Value::None))?;
                object.set_attr("identifiers", args.get(3).cloned().unwrap_or(Value::None))?;
            }
            Ok(node)
        })
        .with_native("make_template_scope", |_, args, _| Ok(args.into_iter().next().unwrap_or(Value::None)))
        .with_native("add_storage", |_, args, _| {
            object_arg(&args, 0)?.set_attr(&arg_str(&args, 1)?, Value::None)?;
            Ok(Value::None)
        })
        .with_native("run_operator", |machine, args, _| run_operator(machine, args))
        .with_native("run_chained_operator", |machine, args, _| run_chained_operator(machine, args))
        .with_native("run_template_operator", |machine, args, _| run_template_operator(machine, args))
        .with_native("add_alias", |_, args, _| {
            let node = object_arg(&args, 0)?;
            let name = arg_str(&args, 1)?;
            record("add_alias", &node, &name);
            let mut path = vec![arg_str(&args, 2)?];
            path.extend(str_tuple(&args, 3)?);
            node.set_attr(&name, Value::str(path.join(".")))?;
            Ok(Value::None)
        })
        .with_native("add_decl_function", |_, args, _| {
            let node = object_arg(&args, 0)?;
            let Some(Value::Function(func)) = args.get(1) else {
                return Err(type_error("add_decl_function expects a function"));
            };
            let name = func.qualname.rsplit('.').next().unwrap_or_default().to_string();
            record("add_decl_function", &node, &name);
            node.set_attr(&name, Value::Function(func.clone()))?;
            node.set_attr(&format!("{}.override", name), args.get(2).cloned().unwrap_or(Value::None))?;
            Ok(Value::None)
        })
        .with_native("remap_error", |_, args, _| {
            let Some(Value::Exception(exc)) = args.first() else {
                return Err(type_error("remap_error expects an exception"));
            };
            let filename = arg_str(&args, 1)?;
            let line = args.get(2).and_then(Value::as_int).unwrap_or(0);
            exc.origin.borrow_mut().get_or_insert((filename, line as u32));
            Ok(Value::Exception(exc.clone()))
        });
    Value::Object(table.into_rc())
}

fn globals(machine: &Machine) -> DictRef {
    let globals = machine.new_globals();
    {
        let mut g = globals.borrow_mut();
        g.set_str(HELPERS_GLOBAL, helper_table());
        g.set_str("Window", Value::Object(AttrObject::new("Window").into_rc()));
        g.set_str("Label", Value::Object(AttrObject::new("Label").into_rc()));
        g.set_str("Row", Value::Object(AttrObject::new("Row").into_rc()));
    }
    globals
}

fn compile(source: &str) -> Result<Vec<CompiledItem>> {
    Ok(Compiler::default().compile_source(source, "main.kn")?.items)
}

/// Runs an outer unit and then its populate function; returns the root.
fn build(machine: &mut Machine, item: &CompiledItem, globals: &DictRef, extra: Vec<Value>) -> Result<Rc<dyn HostObject>, RuntimeError> {
    REGISTRY.with(|nodes| nodes.borrow_mut().clear());
    CALLS.with(|calls| calls.borrow_mut().clear());
    let mut args = vec![Value::Dict(globals.clone()), Value::str("scope-1")];
    args.extend(extra);
    let result = machine.run(&Rc::new(item.unit.clone()), globals, args)?;
    let Value::Tuple(pair) = result else {
        return Err(type_error("outer unit must return a pair"));
    };
    machine.call(&pair[1], Vec::new(), Vec::new())?;
    match &pair[0] {
        Value::Object(root) => Ok(root.clone()),
        _ => Err(type_error("root is not a node")),
    }
}

fn child_attr(root: &Rc<dyn HostObject>, name: &str) -> Option<Value> {
    REGISTRY.with(|nodes| {
        nodes.borrow().iter().find_map(|node| {
            let parent = node.parent()?;
            if !std::ptr::addr_eq(Rc::as_ptr(&parent), Rc::as_ptr(root)) {
                return None;
            }
            node.get_attr(name)
        })
    })
}

#[test]
fn test_declaration_builds_and_binds() -> Result<()> {
    let items = compile(
        "\
declare Main(Window):
    attr count: int = 3
    title = 'hello ' + str(count * 2)
    Label: label:
        text = title.upper()
",
    )?;
    let mut machine = Machine::new();
    let globals = globals(&machine);
    let root = build(&mut machine, &items[0], &globals, Vec::new()).map_err(|e| anyhow!("{}", e))?;

    assert_eq!(root.type_name(), "Main");
    assert_eq!(root.get_attr("count").context("count")?.as_int(), Some(3));
    assert_eq!(root.get_attr("title").context("title")?.to_string(), "hello 6");
    let text = child_attr(&root, "text").context("label text")?;
    assert_eq!(text.to_string(), "HELLO 6");
    Ok(())
}

#[test]
fn test_template_scope_and_defaults() -> Result<()> {
    let items = compile(
        "\
template Row(n, spacing=5):
    const total: int = n + spacing
    Label:
        text = str(total)
",
    )?;
    let row = &items[0];
    let mut machine = Machine::new();
    let globals = globals(&machine);

    let defaults_unit = Rc::new(row.defaults.clone().context("defaults unit")?);
    let owner = AttrObject::new("template").into_rc();
    let (overrides, locals) = (Dict::new().shared(), Dict::new().shared());
    let mut scope = DynamicScope::new(&owner, &overrides, &locals, &globals);
    let defaults = machine
        .eval(&defaults_unit, &globals, &mut scope)
        .map_err(|e| anyhow!("{}", e))?;
    assert_eq!(defaults.repr(), "(5,)");

    let root = build(&mut machine, row, &globals, vec![Value::Int(2), Value::Int(5)]).map_err(|e| anyhow!("{}", e))?;
    let text = child_attr(&root, "text").context("label text")?;
    assert_eq!(text.to_string(), "7");
    Ok(())
}

#[test]
fn test_binding_errors_point_at_the_declaration() -> Result<()> {
    let items = compile("declare Broken(Window):\n    title = 1 / 0\n")?;
    let mut machine = Machine::new();
    let globals = globals(&machine);
    let err = build(&mut machine, &items[0], &globals, Vec::new()).unwrap_err();
    let exc = err.exception().context("expected an exception")?;
    assert!(exc.is_kind(ExceptionKind::ZeroDivisionError));
    assert_eq!(*exc.origin.borrow(), Some(("main.kn".to_string(), 2)));
    assert!(err.to_string().ends_with("(main.kn, line 2)"));
    Ok(())
}

#[test]
fn test_units_survive_serialization() -> Result<()> {
    let items = compile("declare Main(Window):\n    Label:\n        text = 'x'\n")?;
    let bytes = items[0].unit.to_bytes().map_err(|e| anyhow!("{}", e))?;
    let unit = kindle::bytecode::CodeUnit::from_bytes(&bytes).map_err(|e| anyhow!("{}", e))?;
    assert_eq!(unit, items[0].unit);
    Ok(())
}

#[test]
fn test_every_binding_form_reaches_its_helper() -> Result<()> {
    let items = compile(
        "\
declare Main(Window):
    attr count: int = 3
    title = 'n' + str(count)
    label.text << title + '!'
    alias caption: label.text
    func scaled(x, k=2):
        return x * k
    Label: label:
        size = 10
    Row(4): a:
        a.text << str(count + 1)
",
    )?;
    let mut machine = Machine::new();
    let globals = globals(&machine);
    let root = build(&mut machine, &items[0], &globals, Vec::new()).map_err(|e| anyhow!("{}", e))?;

    assert_eq!(
        recorded(),
        vec![
            "run_operator 0 count",
            "run_operator 0 title",
            "run_chained_operator 0 label.text",
            "add_alias 0 caption",
            "add_decl_function 0 scaled",
            "run_operator 1 size",
            "run_template_operator 2 a.text",
        ]
    );

    let label = by_ident("label").context("label node")?;
    assert_eq!(label.ordinal, 1);
    assert_eq!(label.get_attr("text").context("label text")?.to_string(), "n3!");
    assert_eq!(label.get_attr("size").context("label size")?.as_int(), Some(10));
    assert_eq!(root.get_attr("caption").context("alias")?.to_string(), "label.text");

    let scaled = root.get_attr("scaled").context("declared function")?;
    assert_eq!(machine.call(&scaled, vec![Value::Int(5)], Vec::new()).map_err(|e| anyhow!("{}", e))?.as_int(), Some(10));
    assert!(matches!(root.get_attr("scaled.override"), Some(Value::Bool(false))));

    let inst = REGISTRY.with(|nodes| nodes.borrow().get(2).cloned()).context("instance node")?;
    assert_eq!(inst.type_name(), "Row");
    assert_eq!(inst.get_attr("args").context("instance args")?.repr(), "(4,)");
    assert_eq!(inst.get_attr("a.text").context("instance binding")?.to_string(), "4");
    Ok(())
}

#[test]
fn test_override_flag_reaches_the_host() -> Result<()> {
    let items = compile("declare Main(Window):\n    activate => (evt):\n        return evt\n")?;
    let mut machine = Machine::new();
    let globals = globals(&machine);
    let root = build(&mut machine, &items[0], &globals, Vec::new()).map_err(|e| anyhow!("{}", e))?;
    assert_eq!(recorded(), vec!["add_decl_function 0 activate"]);
    assert!(matches!(root.get_attr("activate.override"), Some(Value::Bool(true))));
    Ok(())
}

