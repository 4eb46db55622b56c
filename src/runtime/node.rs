//! Compiled node graph
//!
//! A program is an immutable arena of nodes produced by an external compiler
//! and handed to the engine (usually as JSON). Children are referenced by
//! [`NodeId`], so the graph can be shared read-only by every strand without
//! any locking.
//!
//! Variables use positional (de Bruijn) indices. The scope rules are:
//! - `Sequence`: `right` sees the published value at index 0.
//! - `Prune`: `left` sees the pruning future at index 0.
//! - `Catch`: `handler` sees the exception at index 0.
//! - `DeclareDefs` with `n` definitions: `body` sees definition `j` at index
//!   `n - 1 - j`. A definition body with arity `a` additionally sees its
//!   parameters on top, parameter `k` at index `a - 1 - k`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::error::ProgramError;

/// Index of a node in the program arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source position attached by `WithLocation` nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Source file name.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl SourceLocation {
    /// Create a location.
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Constant embedded in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    /// The unit value.
    Signal,
    /// Signed integer literal.
    Integer(i64),
    /// Floating-point literal.
    Float(f64),
    /// Boolean literal.
    Boolean(bool),
    /// String literal.
    String(String),
    /// List literal.
    List(Vec<Literal>),
}

/// Operand of a call, publication or throw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Arg {
    /// Positional variable reference.
    Var(usize),
    /// Constant value.
    Constant(Literal),
    /// Site looked up by name in the engine's registry.
    Site(String),
}

impl Arg {
    /// Variable at the given index.
    pub fn var(index: usize) -> Self {
        Arg::Var(index)
    }

    /// Integer constant.
    pub fn int(num: i64) -> Self {
        Arg::Constant(Literal::Integer(num))
    }

    /// Boolean constant.
    pub fn boolean(flag: bool) -> Self {
        Arg::Constant(Literal::Boolean(flag))
    }

    /// String constant.
    pub fn string(text: impl Into<String>) -> Self {
        Arg::Constant(Literal::String(text.into()))
    }

    /// The unit constant.
    pub fn signal() -> Self {
        Arg::Constant(Literal::Signal)
    }

    /// Site reference.
    pub fn site(name: impl Into<String>) -> Self {
        Arg::Site(name.into())
    }
}

/// One definition in a `DeclareDefs` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Def {
    /// Definition name (diagnostics only).
    pub name: String,
    /// Number of parameters.
    pub arity: usize,
    /// Body node.
    pub body: NodeId,
}

/// Combinator node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    /// Invoke a site or definition; every returned value is published.
    Call {
        /// Callee operand.
        target: Arg,
        /// Argument operands.
        args: Vec<Arg>,
    },
    /// Publish a single operand.
    Publish {
        /// Published operand.
        value: Arg,
    },
    /// Parallel composition.
    Fork {
        /// Branch continued by the forking strand.
        left: NodeId,
        /// Branch handed to a new strand.
        right: NodeId,
    },
    /// Run `right` once per publication of `left`.
    Sequence {
        /// Producer.
        left: NodeId,
        /// Consumer, sees the value at index 0.
        right: NodeId,
    },
    /// Bind the first publication of `right` into `left`'s scope.
    Prune {
        /// Consumer, sees the future at index 0.
        left: NodeId,
        /// Producer.
        right: NodeId,
        /// Name of the bound variable (diagnostics only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Run `right` only if `left` halts without publishing.
    Otherwise {
        /// Preferred branch.
        left: NodeId,
        /// Fallback branch.
        right: NodeId,
    },
    /// Halt silently.
    Stop,
    /// Scope an exception handler around `body`.
    Catch {
        /// Protected expression.
        body: NodeId,
        /// Handler body, sees the exception at index 0.
        handler: NodeId,
    },
    /// Raise a domain exception.
    Throw {
        /// Exception operand.
        value: Arg,
    },
    /// Bind a group of mutually recursive definitions.
    DeclareDefs {
        /// Definitions in declaration order.
        defs: Vec<Def>,
        /// Scope body.
        body: NodeId,
    },
    /// Attach a source location for diagnostics.
    WithLocation {
        /// Wrapped node.
        body: NodeId,
        /// Location reported in errors.
        location: SourceLocation,
    },
}

/// Immutable compiled program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Program name.
    #[serde(default)]
    pub name: String,
    nodes: Vec<Node>,
    root: NodeId,
}

impl Program {
    /// Create and validate a program.
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<Node>,
        root: NodeId,
    ) -> Result<Self, ProgramError> {
        let program = Self {
            name: name.into(),
            nodes,
            root,
        };
        program.validate()?;
        Ok(program)
    }

    /// Parse and validate a JSON-encoded program.
    pub fn from_json(text: &str) -> Result<Self, ProgramError> {
        let program: Program =
            serde_json::from_str(text).map_err(|err| ProgramError::Decode(err.to_string()))?;
        program.validate()?;
        Ok(program)
    }

    /// Encode the program as JSON.
    pub fn to_json(&self) -> Result<String, ProgramError> {
        serde_json::to_string_pretty(self).map_err(|err| ProgramError::Decode(err.to_string()))
    }

    /// Root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fetch a node. Ids come from a validated program, so lookups are in range.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Hex blake3 digest of the canonical JSON encoding.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&encoded).to_hex().to_string()
    }

    /// Names of every site referenced by a `Site` operand.
    pub fn site_names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            let operands: Vec<&Arg> = match node {
                Node::Call { target, args } => std::iter::once(target).chain(args).collect(),
                Node::Publish { value } | Node::Throw { value } => vec![value],
                _ => continue,
            };
            for operand in operands {
                if let Arg::Site(name) = operand {
                    names.insert(name.as_str());
                }
            }
        }
        names
    }

    /// Check node references, acyclicity and variable scoping.
    ///
    /// Both passes use explicit work stacks, so shared subgraphs are visited
    /// once and arbitrarily deep chains cannot exhaust the native stack.
    pub fn validate(&self) -> Result<(), ProgramError> {
        if self.nodes.is_empty() {
            return Err(ProgramError::Empty);
        }
        if self.get(self.root).is_none() {
            return Err(ProgramError::MissingRoot(self.root));
        }
        self.check_acyclic()?;
        self.check_scopes()
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Child `index` of `id`, with the number of bindings it adds to scope.
    fn child(&self, id: NodeId, index: usize) -> Option<(NodeId, usize)> {
        match self.node(id) {
            Node::Call { .. } | Node::Publish { .. } | Node::Throw { .. } | Node::Stop => None,
            Node::Fork { left, right } | Node::Otherwise { left, right } => {
                [(*left, 0), (*right, 0)].get(index).copied()
            }
            Node::Sequence { left, right } => [(*left, 0), (*right, 1)].get(index).copied(),
            Node::Prune { left, right, .. } => [(*left, 1), (*right, 0)].get(index).copied(),
            Node::Catch { body, handler } => [(*body, 0), (*handler, 1)].get(index).copied(),
            Node::DeclareDefs { defs, body } => match defs.get(index) {
                Some(def) => Some((def.body, defs.len() + def.arity)),
                None if index == defs.len() => Some((*body, defs.len())),
                None => None,
            },
            Node::WithLocation { body, .. } => (index == 0).then_some((*body, 0)),
        }
    }

    /// Depth-first white/grey/black colouring from the root.
    fn check_acyclic(&self) -> Result<(), ProgramError> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let mut colour = vec![WHITE; self.nodes.len()];
        colour[self.root.0 as usize] = GREY;
        // (node, next child to visit)
        let mut stack = vec![(self.root, 0usize)];

        while let Some(&(id, next)) = stack.last() {
            let Some((target, _)) = self.child(id, next) else {
                colour[id.0 as usize] = BLACK;
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            if self.get(target).is_none() {
                return Err(ProgramError::DanglingNode { node: id, target });
            }
            match colour[target.0 as usize] {
                GREY => return Err(ProgramError::Cycle(target)),
                WHITE => {
                    colour[target.0 as usize] = GREY;
                    stack.push((target, 0));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Every variable index must fall inside the static environment depth.
    /// Runs on an acyclic graph; each `(node, depth)` pair is checked once.
    fn check_scopes(&self) -> Result<(), ProgramError> {
        let mut seen = HashSet::new();
        let mut work = vec![(self.root, 0usize)];

        while let Some((id, depth)) = work.pop() {
            if !seen.insert((id, depth)) {
                continue;
            }
            let operands: Vec<&Arg> = match self.node(id) {
                Node::Call { target, args } => std::iter::once(target).chain(args).collect(),
                Node::Publish { value } | Node::Throw { value } => vec![value],
                _ => Vec::new(),
            };
            for operand in operands {
                if let Arg::Var(index) = operand {
                    if *index >= depth {
                        return Err(ProgramError::UnboundVariable {
                            node: id,
                            index: *index,
                            depth,
                        });
                    }
                }
            }

            let first = work.len();
            let mut index = 0;
            while let Some((child, extra)) = self.child(id, index) {
                work.push((child, depth + extra));
                index += 1;
            }
            // Visit children left to right.
            work[first..].reverse();
        }
        Ok(())
    }
}

/// Incremental builder used by compilers and tests to assemble a graph.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    nodes: Vec<Node>,
}

impl ProgramBuilder {
    /// Start an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its id.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// `Call` node.
    pub fn call(&mut self, target: Arg, args: Vec<Arg>) -> NodeId {
        self.add(Node::Call { target, args })
    }

    /// Call a site by name.
    pub fn call_site(&mut self, site: &str, args: Vec<Arg>) -> NodeId {
        self.call(Arg::site(site), args)
    }

    /// `Publish` node.
    pub fn publish(&mut self, value: Arg) -> NodeId {
        self.add(Node::Publish { value })
    }

    /// `Fork` node.
    pub fn fork(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.add(Node::Fork { left, right })
    }

    /// `Sequence` node.
    pub fn sequence(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.add(Node::Sequence { left, right })
    }

    /// `Prune` node.
    pub fn prune(&mut self, left: NodeId, right: NodeId, name: Option<&str>) -> NodeId {
        self.add(Node::Prune {
            left,
            right,
            name: name.map(str::to_string),
        })
    }

    /// `Otherwise` node.
    pub fn otherwise(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.add(Node::Otherwise { left, right })
    }

    /// `Stop` node.
    pub fn stop(&mut self) -> NodeId {
        self.add(Node::Stop)
    }

    /// `Catch` node.
    pub fn catch(&mut self, body: NodeId, handler: NodeId) -> NodeId {
        self.add(Node::Catch { body, handler })
    }

    /// `Throw` node.
    pub fn throw(&mut self, value: Arg) -> NodeId {
        self.add(Node::Throw { value })
    }

    /// `DeclareDefs` node.
    pub fn declare_defs(&mut self, defs: Vec<Def>, body: NodeId) -> NodeId {
        self.add(Node::DeclareDefs { defs, body })
    }

    /// `WithLocation` node.
    pub fn with_location(&mut self, body: NodeId, location: SourceLocation) -> NodeId {
        self.add(Node::WithLocation { body, location })
    }

    /// Finish the graph rooted at `root`.
    pub fn build(self, name: &str, root: NodeId) -> Result<Program, ProgramError> {
        Program::new(name, self.nodes, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_scoped_variables() {
        let mut b = ProgramBuilder::new();
        let body = b.call_site("println", vec![Arg::var(0)]);
        let one = b.publish(Arg::int(1));
        let two = b.publish(Arg::int(2));
        let both = b.fork(one, two);
        let root = b.prune(body, both, Some("x"));

        assert!(b.build("prune", root).is_ok());
    }

    #[test]
    fn test_validate_rejects_unbound_variable() {
        let mut b = ProgramBuilder::new();
        let root = b.publish(Arg::var(0));

        let err = b.build("bad", root).unwrap_err();
        assert_eq!(
            err,
            ProgramError::UnboundVariable {
                node: NodeId(0),
                index: 0,
                depth: 0
            }
        );
    }

    #[test]
    fn test_validate_rejects_dangling_and_cyclic_graphs() {
        let dangling = Program::new(
            "dangling",
            vec![Node::Fork {
                left: NodeId(0),
                right: NodeId(7),
            }],
            NodeId(0),
        );
        assert!(matches!(dangling, Err(ProgramError::Cycle(NodeId(0)))));

        let missing = Program::new(
            "missing",
            vec![
                Node::Stop,
                Node::Fork {
                    left: NodeId(0),
                    right: NodeId(9),
                },
            ],
            NodeId(1),
        );
        assert!(matches!(
            missing,
            Err(ProgramError::DanglingNode {
                target: NodeId(9),
                ..
            })
        ));
    }

    #[test]
    fn test_shared_subgraphs_are_validated_once() {
        // nodes[k] = Fork(k - 1, k - 1): 2^30 root-to-leaf paths over 31 nodes.
        let mut nodes = vec![Node::Publish { value: Arg::int(1) }];
        for k in 1..=30u32 {
            nodes.push(Node::Fork {
                left: NodeId(k - 1),
                right: NodeId(k - 1),
            });
        }
        let program = Program::new("diamonds", nodes, NodeId(30)).unwrap();
        assert_eq!(program.len(), 31);
    }

    #[test]
    fn test_deep_chains_validate_without_recursion() {
        let depth = 200_000u32;
        let mut nodes = vec![Node::Publish { value: Arg::int(1) }];
        for k in 1..=depth {
            nodes.push(Node::WithLocation {
                body: NodeId(k - 1),
                location: SourceLocation::new("deep.orc", k, 1),
            });
        }
        assert!(Program::new("deep", nodes, NodeId(depth)).is_ok());

        // A nested sequence chain grows the scope at every level.
        let mut nodes = vec![Node::Publish { value: Arg::var(0) }];
        for k in 1..=depth {
            nodes.push(Node::Stop);
            let stop = NodeId(2 * k - 1);
            nodes.push(Node::Sequence {
                left: stop,
                right: NodeId(2 * k - 2),
            });
        }
        assert!(Program::new("nested", nodes, NodeId(2 * depth)).is_ok());
    }

    #[test]
    fn test_shared_node_is_scoped_at_every_depth() {
        // The shared leaf reads index 0: fine under the Sequence, unbound at the root.
        let nodes = vec![
            Node::Publish { value: Arg::var(0) },
            Node::Sequence {
                left: NodeId(0),
                right: NodeId(0),
            },
        ];
        let err = Program::new("shared", nodes, NodeId(1)).unwrap_err();
        assert_eq!(
            err,
            ProgramError::UnboundVariable {
                node: NodeId(0),
                index: 0,
                depth: 0
            }
        );
    }

    #[test]
    fn test_definition_scope_includes_group_and_params() {
        let mut b = ProgramBuilder::new();
        // def f(a, b) = g(b)   ;   def g(x) = x   ;   f(1, 2)
        let f_body = b.call(Arg::var(2), vec![Arg::var(0)]);
        let g_body = b.publish(Arg::var(0));
        let main = b.call(Arg::var(1), vec![Arg::int(1), Arg::int(2)]);
        let root = b.declare_defs(
            vec![
                Def {
                    name: "f".into(),
                    arity: 2,
                    body: f_body,
                },
                Def {
                    name: "g".into(),
                    arity: 1,
                    body: g_body,
                },
            ],
            main,
        );
        assert!(b.build("defs", root).is_ok());
    }

    #[test]
    fn test_site_names_are_collected_once() {
        let mut b = ProgramBuilder::new();
        let first = b.call_site("println", vec![Arg::site("add")]);
        let second = b.call_site("println", vec![Arg::int(1)]);
        let root = b.fork(first, second);
        let program = b.build("sites", root).unwrap();

        let names: Vec<_> = program.site_names().into_iter().collect();
        assert_eq!(names, vec!["add", "println"]);
    }

    #[test]
    fn test_json_round_trip_preserves_fingerprint() {
        let mut b = ProgramBuilder::new();
        let one = b.publish(Arg::int(1));
        let root = b.with_location(one, SourceLocation::new("main.orc", 1, 1));
        let program = b.build("loc", root).unwrap();

        let json = program.to_json().unwrap();
        let decoded = Program::from_json(&json).unwrap();
        assert_eq!(decoded, program);
        assert_eq!(decoded.fingerprint(), program.fingerprint());
    }
}
