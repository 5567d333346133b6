//! First pass: number every construct-producing node.

use crate::ast::{BodyItem, ObjectDef, Template, TemplateItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The declared object or the template itself; always index 0.
    Root,
    Child,
    TemplateInst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub parent: Option<usize>,
    pub lineno: usize,
}

/// Dense pre-order node indexes with parent links, for one definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    nodes: Vec<NodeRecord>,
}

impl Layout {
    pub fn of_object(def: &ObjectDef) -> Layout {
        let mut layout = Layout::default();
        let root = layout.push(NodeKind::Root, None, def.lineno);
        layout.visit_body(&def.body, root);
        log::trace!("layout of {}: {} nodes", def.typename, layout.len());
        layout
    }

    pub fn of_template(template: &Template) -> Layout {
        let mut layout = Layout::default();
        let root = layout.push(NodeKind::Root, None, template.lineno);
        for item in &template.body {
            match item {
                TemplateItem::Const(_) => {}
                TemplateItem::Child(child) => {
                    let index = layout.push(NodeKind::Child, Some(root), child.lineno);
                    layout.visit_body(&child.body, index);
                }
                TemplateItem::Inst(inst) => {
                    layout.push(NodeKind::TemplateInst, Some(root), inst.lineno);
                }
            }
        }
        log::trace!("layout of template {}: {} nodes", template.name, layout.len());
        layout
    }

    fn visit_body(&mut self, body: &[BodyItem], parent: usize) {
        for item in body {
            match item {
                BodyItem::Child(child) => {
                    let index = self.push(NodeKind::Child, Some(parent), child.lineno);
                    self.visit_body(&child.body, index);
                }
                BodyItem::TemplateInst(inst) => {
                    self.push(NodeKind::TemplateInst, Some(parent), inst.lineno);
                }
                _ => {}
            }
        }
    }

    fn push(&mut self, kind: NodeKind, parent: Option<usize>, lineno: usize) -> usize {
        self.nodes.push(NodeRecord { kind, parent, lineno });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NodeRecord> {
        self.nodes.get(index)
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).and_then(|n| n.parent)
    }

    pub fn records(&self) -> &[NodeRecord] {
        &self.nodes
    }
}

/// Hands out indexes in the same pre-order as [`Layout`] and checks each
/// against the recorded kind, so later passes cannot drift from pass one.
pub struct Cursor<'a> {
    layout: &'a Layout,
    next: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout, next: 0 }
    }

    pub fn take(&mut self, kind: NodeKind) -> Option<(usize, &'a NodeRecord)> {
        let record = self.layout.get(self.next).filter(|r| r.kind == kind)?;
        let index = self.next;
        self.next += 1;
        Some((index, record))
    }

    pub fn finished(&self) -> bool {
        self.next == self.layout.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;
    use crate::parser::parse_source;
    use crate::ast::Item;

    #[test]
    fn test_pre_order_indexes() {
        let src = "\
declare Main(Window):
    Row:
        Label: a:
            text = 'x'
        Button:
            pass
    Pair(1, 2): p, q:
        p.text = 'y'
    Label:
        pass
";
        let module = parse_source(src, "t.kn", &Grammar::default()).unwrap();
        let Item::Object(def) = &module.items[0] else { panic!("expected object") };
        let layout = Layout::of_object(def);
        let parents: Vec<Option<usize>> = layout.records().iter().map(|r| r.parent).collect();
        assert_eq!(parents, vec![None, Some(0), Some(1), Some(1), Some(0), Some(0)]);
        assert_eq!(layout.get(4).map(|r| r.kind), Some(NodeKind::TemplateInst));

        let mut cursor = Cursor::new(&layout);
        assert!(cursor.take(NodeKind::Root).is_some());
        assert!(cursor.take(NodeKind::TemplateInst).is_none());
        assert_eq!(cursor.take(NodeKind::Child).map(|(i, _)| i), Some(1));
        assert!(!cursor.finished());
    }

    #[test]
    fn test_template_layout() {
        let src = "\
template Pair(a, b):
    const n = a + b
    Label:
        pass
    Other(n):
        pass
";
        let module = parse_source(src, "t.kn", &Grammar::default()).unwrap();
        let Item::Template(template) = &module.items[0] else { panic!("expected template") };
        let layout = Layout::of_template(template);
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.parent(2), Some(0));
    }
}
