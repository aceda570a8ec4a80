//! Builds the work graph: expands a seed set of nodes into a DAG by
//! walking outgoing links, with optional prune and combine passes and a
//! Graphviz dump.

use crate::db::{Db, DbError, TUP_CONFIG};
use crate::entry::{Entry, NodeType, Tupid, ENV_DT, EXCLUSION_DT};
use crate::flags::Flag;
use crate::link::LinkStyle;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct GraphNode {
    pub tent: Entry,
    /// Outgoing edges, in insertion order.
    pub edges: Vec<(NodeId, LinkStyle)>,
}

/// Display and expansion toggles, passed explicitly by the caller.
#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    pub show_dirs: bool,
    pub show_ghosts: bool,
    pub show_env: bool,
    pub stickies: bool,
    pub combine: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PrunePolicy {
    /// Everything reachable to or from the targets.
    All,
    /// The targets and everything they transitively depend on.
    Upwards,
    /// The targets and everything that transitively depends on them.
    Downwards,
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    index: HashMap<Tupid, NodeId>,
}

impl Graph {
    /// Seeds from the current create and modify sets: the default work set.
    pub fn build_from_flags(db: &mut Db, opts: &GraphOptions) -> Result<Graph, DbError> {
        let mut seeds = db.flag_ids(Flag::Create)?;
        seeds.extend(db.flag_ids(Flag::Modify)?);
        seeds.sort();
        seeds.dedup();
        Graph::build(db, &seeds, opts)
    }

    /// Expands the seed set into a DAG.  Deterministic given the seeds and
    /// the store contents: the worklist runs in insertion order and every
    /// store query yields ascending ids.
    pub fn build(db: &mut Db, seeds: &[Tupid], opts: &GraphOptions) -> Result<Graph, DbError> {
        let mut g = Graph::default();
        let mut pending = VecDeque::new();
        for &seed in seeds {
            let tent = db.get_or_load(seed)?;
            if g.skip(&tent, opts) {
                continue;
            }
            if let Some(id) = g.add_node(tent) {
                pending.push_back(id);
            }
        }

        while let Some(n) = pending.pop_front() {
            let tent = g.nodes[n.index()].tent.clone();

            for target in db.outgoing(tent.id, LinkStyle::Normal)? {
                if g.skip(&target, opts) {
                    continue;
                }
                let m = g.ensure_node(target, &mut pending);
                g.add_edge(n, m, LinkStyle::Normal);
            }

            if tent.ntype == NodeType::Group {
                for cmd in db.distinct_group_targets(tent.id)? {
                    let m = g.ensure_node(cmd, &mut pending);
                    g.add_edge(n, m, LinkStyle::Group);
                }
            }

            // Directory fan-out: everything under a non-file, non-config
            // node joins the graph.  This is what makes `graph dir/` pull
            // in the whole subtree.
            if tent.name != TUP_CONFIG
                && !matches!(tent.ntype, NodeType::File | NodeType::GeneratedFile)
            {
                for child in db.dir_entries(tent.id)? {
                    if g.skip(&child, opts) {
                        continue;
                    }
                    g.ensure_node(child, &mut pending);
                }
            }
        }

        if opts.stickies {
            let mut i = 0;
            while i < g.nodes.len() {
                let from_id = g.nodes[i].tent.id;
                for target in db.outgoing(from_id, LinkStyle::Sticky)? {
                    if g.skip(&target, opts) {
                        continue;
                    }
                    let mut unused = VecDeque::new();
                    let m = g.ensure_node(target, &mut unused);
                    g.add_edge(NodeId(i), m, LinkStyle::Sticky);
                }
                i += 1;
            }
        }

        Ok(g)
    }

    fn skip(&self, tent: &Entry, opts: &GraphOptions) -> bool {
        if tent.ntype == NodeType::Ghost && !opts.show_ghosts {
            return true;
        }
        if !opts.show_env && (tent.id == ENV_DT || tent.parent == ENV_DT) {
            return true;
        }
        if tent.id == EXCLUSION_DT || tent.parent == EXCLUSION_DT {
            return true;
        }
        false
    }

    fn add_node(&mut self, tent: Entry) -> Option<NodeId> {
        if self.index.contains_key(&tent.id) {
            return None;
        }
        let id = NodeId(self.nodes.len());
        self.index.insert(tent.id, id);
        self.nodes.push(GraphNode {
            tent,
            edges: Vec::new(),
        });
        Some(id)
    }

    fn ensure_node(&mut self, tent: Entry, pending: &mut VecDeque<NodeId>) -> NodeId {
        match self.index.get(&tent.id) {
            Some(&id) => id,
            None => {
                let id = self.add_node(tent).unwrap();
                pending.push_back(id);
                id
            }
        }
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, style: LinkStyle) {
        if from == to {
            return;
        }
        let edges = &mut self.nodes[from.index()].edges;
        if !edges.contains(&(to, style)) {
            edges.push((to, style));
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: Tupid) -> bool {
        self.index.contains_key(&id)
    }

    /// Node ids in the graph, ascending.
    pub fn tupids(&self) -> Vec<Tupid> {
        let mut ids: Vec<Tupid> = self.nodes.iter().map(|n| n.tent.id).collect();
        ids.sort();
        ids
    }

    pub fn node(&self, id: Tupid) -> Option<&GraphNode> {
        self.index.get(&id).map(|n| &self.nodes[n.index()])
    }

    /// Keeps only nodes the policy reaches from the targets.  Returns how
    /// many nodes were cut.  Pure reachability; ties resolve by ascending
    /// id because the surviving set is rebuilt in id order.
    pub fn prune(&mut self, targets: &[Tupid], policy: PrunePolicy) -> Result<usize, DbError> {
        let mut roots = Vec::new();
        for &t in targets {
            match self.index.get(&t) {
                Some(&id) => roots.push(id),
                None => {
                    return Err(DbError::Invariant(format!(
                        "prune target {} is not in the graph",
                        t
                    )))
                }
            }
        }

        let mut reverse: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for &(to, _) in &node.edges {
                reverse[to.index()].push(NodeId(i));
            }
        }

        let reach = |neighbours: &dyn Fn(NodeId) -> Vec<NodeId>| -> HashSet<NodeId> {
            let mut seen = HashSet::new();
            let mut queue: VecDeque<NodeId> = roots.iter().copied().collect();
            while let Some(n) = queue.pop_front() {
                if !seen.insert(n) {
                    continue;
                }
                for m in neighbours(n) {
                    queue.push_back(m);
                }
            }
            seen
        };

        let mut keep = HashSet::new();
        if matches!(policy, PrunePolicy::All | PrunePolicy::Upwards) {
            keep.extend(reach(&|n: NodeId| reverse[n.index()].clone()));
        }
        if matches!(policy, PrunePolicy::All | PrunePolicy::Downwards) {
            keep.extend(reach(&|n: NodeId| {
                self.nodes[n.index()].edges.iter().map(|&(to, _)| to).collect()
            }));
        }

        let before = self.nodes.len();
        let mut kept: Vec<GraphNode> = Vec::new();
        let mut order: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| keep.contains(&NodeId(i)))
            .collect();
        order.sort_by_key(|&i| self.nodes[i].tent.id);

        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for (new_idx, &old_idx) in order.iter().enumerate() {
            remap.insert(NodeId(old_idx), NodeId(new_idx));
        }
        for &old_idx in &order {
            let node = &self.nodes[old_idx];
            let edges = node
                .edges
                .iter()
                .filter_map(|&(to, style)| remap.get(&to).map(|&to| (to, style)))
                .collect();
            kept.push(GraphNode {
                tent: node.tent.clone(),
                edges,
            });
        }
        self.nodes = kept;
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.tent.id, NodeId(i)))
            .collect();
        Ok(before - self.nodes.len())
    }

    /// Commands with no in-graph predecessor that is itself produced
    /// within the graph; these can run first.
    pub fn ready_commands(&self) -> Vec<Tupid> {
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for &(to, _) in &node.edges {
                preds[to.index()].push(i);
            }
        }
        let mut ready = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.tent.ntype != NodeType::Command {
                continue;
            }
            if preds[i].iter().all(|&p| preds[p].is_empty()) {
                ready.push(node.tent.id);
            }
        }
        ready.sort();
        ready
    }

    fn shape(ntype: NodeType) -> (&'static str, &'static str) {
        match ntype {
            NodeType::File => ("oval", ""),
            NodeType::GeneratedFile => ("oval", " style=\"dashed\""),
            NodeType::Command => ("rectangle", ""),
            NodeType::Dir => ("folder", ""),
            NodeType::GeneratedDir => ("folder", " style=\"dashed\""),
            NodeType::Ghost => ("oval", " style=\"dotted\""),
            NodeType::Var => ("diamond", ""),
            NodeType::Group => ("hexagon", ""),
        }
    }

    fn edge_attr(style: LinkStyle) -> &'static str {
        match style {
            LinkStyle::Normal => "",
            LinkStyle::Sticky => " [style=\"dotted\"]",
            LinkStyle::Group => " [style=\"bold\"]",
        }
    }

    /// Writes the graph as one Graphviz digraph, nodes ascending by id.
    pub fn dump<W: Write>(
        &self,
        db: &mut Db,
        w: &mut W,
        opts: &GraphOptions,
    ) -> Result<(), DbError> {
        let hidden = |tent: &Entry| tent.ntype.is_dir() && !opts.show_dirs;

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&i| self.nodes[i].tent.id);

        writeln!(w, "digraph G {{")?;

        // Combine folds same-directory same-type file clusters into one
        // display node.
        let mut cluster: HashMap<usize, (Tupid, NodeType)> = HashMap::new();
        let mut cluster_size: HashMap<(Tupid, NodeType), usize> = HashMap::new();
        if opts.combine {
            for &i in &order {
                let tent = &self.nodes[i].tent;
                if matches!(tent.ntype, NodeType::File | NodeType::GeneratedFile) {
                    let key = (tent.parent, tent.ntype);
                    cluster.insert(i, key);
                    *cluster_size.entry(key).or_insert(0) += 1;
                }
            }
            cluster.retain(|_, key| cluster_size[key] > 1);
        }

        let node_name = |i: usize, cluster: &HashMap<usize, (Tupid, NodeType)>| -> String {
            match cluster.get(&i) {
                Some((dir, ntype)) => format!("c{}_{}", dir.0, ntype.to_int()),
                None => format!("n{}", self.nodes[i].tent.id),
            }
        };

        let mut emitted_clusters = HashSet::new();
        for &i in &order {
            let tent = &self.nodes[i].tent;
            if hidden(tent) {
                continue;
            }
            if let Some(&key) = cluster.get(&i) {
                if emitted_clusters.insert(key) {
                    let dir = db.path_of(key.0)?;
                    let (shape, extra) = Graph::shape(key.1);
                    writeln!(
                        w,
                        "\t{} [label=\"{} ({} in {})\" shape=\"{}\"{}];",
                        node_name(i, &cluster),
                        key.1,
                        cluster_size[&key],
                        escape(&dir),
                        shape,
                        extra
                    )?;
                }
                continue;
            }
            let (shape, extra) = Graph::shape(tent.ntype);
            writeln!(
                w,
                "\tn{} [label=\"{}\" shape=\"{}\"{}];",
                tent.id,
                escape(tent.label()),
                shape,
                extra
            )?;
        }

        let mut emitted_edges = HashSet::new();
        for &i in &order {
            if hidden(&self.nodes[i].tent) {
                continue;
            }
            let from = node_name(i, &cluster);
            let mut edges = self.nodes[i].edges.clone();
            edges.sort_by_key(|&(to, style)| (self.nodes[to.index()].tent.id, style.to_int()));
            for (to, style) in edges {
                if hidden(&self.nodes[to.index()].tent) {
                    continue;
                }
                let to_name = node_name(to.index(), &cluster);
                if from == to_name {
                    continue;
                }
                if emitted_edges.insert((from.clone(), to_name.clone(), style.to_int())) {
                    writeln!(w, "\t{} -> {}{};", from, to_name, Graph::edge_attr(style))?;
                }
            }
        }

        writeln!(w, "}}")?;
        Ok(())
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Mtime, DOT_DT};

    struct Fixture {
        db: Db,
        a_c: Tupid,
        cc: Tupid,
        a_o: Tupid,
        link: Tupid,
        prog: Tupid,
    }

    /// a.c -> cc -> a.o -> link -> prog
    fn fixture() -> Fixture {
        let mut db = Db::open_memory().unwrap();
        db.begin().unwrap();
        let mut node = |db: &mut Db, name: &str, ntype| {
            db.node_insert(DOT_DT, name, ntype, Mtime::Unknown, Tupid::NONE)
                .unwrap()
                .id
        };
        let a_c = node(&mut db, "a.c", NodeType::File);
        let cc = node(&mut db, "cc a.c", NodeType::Command);
        let a_o = node(&mut db, "a.o", NodeType::GeneratedFile);
        let link = node(&mut db, "link a.o", NodeType::Command);
        let prog = node(&mut db, "prog", NodeType::GeneratedFile);
        db.create_link(a_c, cc, LinkStyle::Normal).unwrap();
        db.create_link(cc, a_o, LinkStyle::Normal).unwrap();
        db.create_link(a_o, link, LinkStyle::Normal).unwrap();
        db.create_link(link, prog, LinkStyle::Normal).unwrap();
        Fixture {
            db,
            a_c,
            cc,
            a_o,
            link,
            prog,
        }
    }

    #[test]
    fn expansion_follows_normal_links() -> Result<(), DbError> {
        let mut f = fixture();
        let g = Graph::build(&mut f.db, &[f.a_c], &GraphOptions::default())?;
        assert_eq!(g.tupids(), vec![f.a_c, f.cc, f.a_o, f.link, f.prog]);
        Ok(())
    }

    #[test]
    fn identical_seeds_give_identical_graphs() -> Result<(), DbError> {
        let mut f = fixture();
        let opts = GraphOptions::default();
        let g1 = Graph::build(&mut f.db, &[f.a_c], &opts)?;
        let g2 = Graph::build(&mut f.db, &[f.a_c], &opts)?;
        assert_eq!(g1.tupids(), g2.tupids());
        let mut d1 = Vec::new();
        let mut d2 = Vec::new();
        g1.dump(&mut f.db, &mut d1, &opts)?;
        g2.dump(&mut f.db, &mut d2, &opts)?;
        assert_eq!(d1, d2);
        Ok(())
    }

    #[test]
    fn prune_upwards_keeps_ancestors_only() -> Result<(), DbError> {
        let mut f = fixture();
        let extra = f
            .db
            .node_insert(DOT_DT, "b.c", NodeType::File, Mtime::Unknown, Tupid::NONE)?
            .id;
        let mut g = Graph::build(&mut f.db, &[f.a_c, extra], &GraphOptions::default())?;
        assert!(g.contains(extra));
        let cut = g.prune(&[f.a_o], PrunePolicy::Upwards)?;
        assert_eq!(g.tupids(), vec![f.a_c, f.cc, f.a_o]);
        assert_eq!(cut, 3);
        Ok(())
    }

    #[test]
    fn prune_downwards_keeps_dependents() -> Result<(), DbError> {
        let mut f = fixture();
        let mut g = Graph::build(&mut f.db, &[f.a_c], &GraphOptions::default())?;
        g.prune(&[f.a_o], PrunePolicy::Downwards)?;
        assert_eq!(g.tupids(), vec![f.a_o, f.link, f.prog]);
        Ok(())
    }

    #[test]
    fn group_seeds_fan_out_to_producers() -> Result<(), DbError> {
        let mut f = fixture();
        let group = f
            .db
            .node_insert(DOT_DT, "<objs>", NodeType::Group, Mtime::Unknown, Tupid::NONE)?
            .id;
        f.db.create_link(f.cc, group, LinkStyle::Group)?;
        let g = Graph::build(&mut f.db, &[group], &GraphOptions::default())?;
        assert!(g.contains(f.cc));
        Ok(())
    }

    #[test]
    fn dump_is_a_digraph_with_typed_shapes() -> Result<(), DbError> {
        let mut f = fixture();
        let g = Graph::build(&mut f.db, &[f.a_c], &GraphOptions::default())?;
        let mut out = Vec::new();
        g.dump(&mut f.db, &mut out, &GraphOptions::default())?;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("digraph G {"));
        assert!(text.contains("shape=\"rectangle\""));
        assert!(text.contains(&format!("n{} -> n{}", f.a_c, f.cc)));
        assert!(text.ends_with("}\n"));
        Ok(())
    }

    #[test]
    fn ready_commands_ignore_generated_inputs_outside_graph() -> Result<(), DbError> {
        let mut f = fixture();
        let g = Graph::build(&mut f.db, &[f.a_c], &GraphOptions::default())?;
        // cc reads only a source file; link waits on cc's output.
        assert_eq!(g.ready_commands(), vec![f.cc]);
        Ok(())
    }
}
