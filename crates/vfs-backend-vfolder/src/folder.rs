//! The virtual folder tree: an arena of [`FolderNode`]s referencing each
//! other by index rather than by pointer. An arena sidesteps the aliasing
//! an `Rc<RefCell<_>>` parent-and-children shape would need while keeping
//! every node `Send + Sync`.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::config::FolderSpec;
use crate::pool::Pool;
use crate::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FolderId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    File(String),
    Folder(FolderId),
}

pub struct FolderNode {
    pub name: String,
    pub desktop_file: Option<PathBuf>,
    pub query: Option<Query>,
    pub excludes: HashSet<String>,
    pub includes: Vec<String>,
    pub subfolders: Vec<FolderId>,
    pub parent: Option<FolderId>,
    pub read_only: bool,
    pub dont_show_if_empty: bool,
    pub up_to_date: bool,
    pub sorted: bool,
    pub entries: Vec<EntryRef>,
}

pub struct FolderTree {
    nodes: Vec<FolderNode>,
}

impl FolderTree {
    /// Build a tree from a parsed [`FolderSpec`], returning the tree and
    /// the id of its root.
    pub fn build(spec: &FolderSpec, desktop_dir: Option<&std::path::Path>) -> (FolderTree, FolderId) {
        let mut tree = FolderTree { nodes: Vec::new() };
        let root = tree.insert(spec, None, desktop_dir);
        (tree, root)
    }

    fn insert(
        &mut self,
        spec: &FolderSpec,
        parent: Option<FolderId>,
        desktop_dir: Option<&std::path::Path>,
    ) -> FolderId {
        let desktop_file = spec.desktop_file.as_ref().map(|f| {
            let path = PathBuf::from(f);
            if path.is_absolute() {
                path
            } else {
                desktop_dir.map(|d| d.join(&path)).unwrap_or(path)
            }
        });

        let id = FolderId(self.nodes.len());
        self.nodes.push(FolderNode {
            name: spec.name.clone(),
            desktop_file,
            query: spec.query.clone(),
            excludes: spec.excludes.iter().cloned().collect(),
            includes: spec.includes.clone(),
            subfolders: Vec::new(),
            parent,
            read_only: spec.read_only,
            dont_show_if_empty: spec.dont_show_if_empty,
            up_to_date: false,
            sorted: false,
            entries: Vec::new(),
        });

        let children: Vec<FolderId> = spec
            .subfolders
            .iter()
            .map(|child| self.insert(child, Some(id), desktop_dir))
            .collect();
        self.nodes[id.0].subfolders = children;
        id
    }

    /// Export back to a [`FolderSpec`] tree for persistence.
    pub fn export(&self, id: FolderId) -> FolderSpec {
        let node = &self.nodes[id.0];
        FolderSpec {
            name: node.name.clone(),
            desktop_file: node
                .desktop_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            includes: node.includes.clone(),
            excludes: {
                let mut v: Vec<String> = node.excludes.iter().cloned().collect();
                v.sort();
                v
            },
            query: node.query.clone(),
            subfolders: node.subfolders.iter().map(|&c| self.export(c)).collect(),
            read_only: node.read_only,
            dont_show_if_empty: node.dont_show_if_empty,
        }
    }

    pub fn node(&self, id: FolderId) -> &FolderNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: FolderId) -> &mut FolderNode {
        &mut self.nodes[id.0]
    }

    /// True if any folder's include list still names `basename`.
    pub fn referenced_in_includes(&self, basename: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.includes.iter().any(|i| i == basename))
    }

    pub fn subfolder_named(&self, parent: FolderId, name: &str) -> Option<FolderId> {
        self.nodes[parent.0]
            .subfolders
            .iter()
            .copied()
            .find(|&id| self.nodes[id.0].name == name)
    }

    pub fn append_subfolder(&mut self, parent: FolderId, spec: &FolderSpec) -> FolderId {
        let desktop_dir = self.nodes[parent.0]
            .desktop_file
            .as_ref()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf());
        let id = self.insert(spec, Some(parent), desktop_dir.as_deref());
        self.nodes[parent.0].subfolders.push(id);
        self.invalidate(parent);
        id
    }

    pub fn remove_subfolder(&mut self, parent: FolderId, child: FolderId) {
        self.nodes[parent.0].subfolders.retain(|&id| id != child);
        self.invalidate(parent);
    }

    /// Clear `up_to_date`/`sorted` on `id` and every ancestor.
    pub fn invalidate(&mut self, id: FolderId) {
        let mut current = Some(id);
        while let Some(c) = current {
            self.nodes[c.0].up_to_date = false;
            self.nodes[c.0].sorted = false;
            current = self.nodes[c.0].parent;
        }
    }

    /// A change to the global pool can affect any folder's query
    /// evaluation, so it invalidates the whole tree rather than just the
    /// root-to-leaf path a single folder edit would.
    pub fn invalidate_all(&mut self) {
        for node in &mut self.nodes {
            node.up_to_date = false;
            node.sorted = false;
        }
    }

    /// Materialise `id`'s cached entry list: resolved includes first, then
    /// query matches from the pool, subfolders prepended, excludes removed
    /// last. A no-op while `up_to_date` holds.
    pub fn ensure_folder(&mut self, pool: &Pool, id: FolderId) {
        if self.nodes[id.0].up_to_date {
            return;
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut files = Vec::new();
        for name in self.nodes[id.0].includes.clone() {
            if pool.contains(&name) && seen.insert(name.clone()) {
                files.push(name);
            }
        }
        if let Some(query) = self.nodes[id.0].query.clone() {
            for (basename, entry) in pool.iter() {
                if seen.contains(basename) {
                    continue;
                }
                if query.eval(basename, entry) {
                    seen.insert(basename.clone());
                    files.push(basename.clone());
                }
            }
        }

        let excludes = self.nodes[id.0].excludes.clone();
        files.retain(|name| !excludes.contains(name));

        let mut entries: Vec<EntryRef> = self.nodes[id.0]
            .subfolders
            .iter()
            .map(|&f| EntryRef::Folder(f))
            .collect();
        entries.extend(files.into_iter().map(EntryRef::File));

        let node = &mut self.nodes[id.0];
        node.entries = entries;
        node.up_to_date = true;
        node.sorted = false;
    }

    /// Named entries from the linked `.directory` file's persisted order
    /// come first, in that order; everything else keeps its
    /// materialisation order.
    pub fn ensure_folder_sort(&mut self, id: FolderId) {
        if self.nodes[id.0].sorted {
            return;
        }

        let order = self.nodes[id.0]
            .desktop_file
            .as_ref()
            .and_then(|p| read_sort_order(p));

        if let Some(order) = order {
            let node = &mut self.nodes[id.0];
            let mut ranked: Vec<(usize, EntryRef)> = node
                .entries
                .drain(..)
                .map(|e| {
                    let rank = match &e {
                        EntryRef::File(name) => {
                            order.iter().position(|n| n == name).unwrap_or(usize::MAX)
                        }
                        EntryRef::Folder(_) => usize::MAX,
                    };
                    (rank, e)
                })
                .collect();
            ranked.sort_by_key(|(rank, _)| *rank);
            node.entries = ranked.into_iter().map(|(_, e)| e).collect();
        }

        self.nodes[id.0].sorted = true;
    }

    /// Persist `entries`' current order to `id`'s linked `.directory`
    /// file, creating it if necessary. A no-op if the folder has none.
    pub fn persist_sort_order(&self, id: FolderId) -> std::io::Result<()> {
        let node = &self.nodes[id.0];
        let Some(path) = &node.desktop_file else {
            return Ok(());
        };
        let names: Vec<&str> = node
            .entries
            .iter()
            .filter_map(|e| match e {
                EntryRef::File(name) => Some(name.as_str()),
                EntryRef::Folder(_) => None,
            })
            .collect();
        write_sort_order(path, &names)
    }
}

const SORT_ORDER_KEY: &str = "X-VfsItemOrder";

fn read_sort_order(path: &std::path::Path) -> Option<Vec<String>> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix(&format!("{SORT_ORDER_KEY}=")) {
            return Some(
                value
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
    }
    None
}

fn write_sort_order(path: &std::path::Path, names: &[&str]) -> std::io::Result<()> {
    let line = format!("{SORT_ORDER_KEY}={};", names.join(";"));
    let existing = std::fs::read_to_string(path).unwrap_or_else(|_| "[Desktop Entry]\n".to_string());
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    match lines.iter().position(|l| l.starts_with(&format!("{SORT_ORDER_KEY}="))) {
        Some(idx) => lines[idx] = line,
        None => lines.push(line),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, lines.join("\n") + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FileEntry;
    use std::collections::HashSet as StdHashSet;

    fn spec(name: &str, includes: &[&str], subfolders: Vec<FolderSpec>) -> FolderSpec {
        FolderSpec {
            name: name.to_string(),
            includes: includes.iter().map(|s| s.to_string()).collect(),
            subfolders,
            ..Default::default()
        }
    }

    fn pool_with(names: &[&str]) -> Pool {
        let mut pool = Pool::default();
        for n in names {
            pool.insert(
                n.to_string(),
                FileEntry {
                    filename: PathBuf::from(format!("/apps/{n}")),
                    per_user: false,
                    keywords: StdHashSet::new(),
                    implicit_keywords: false,
                },
            );
        }
        pool
    }

    #[test]
    fn ensure_folder_resolves_includes() {
        let root_spec = spec("Root", &["a.desktop"], vec![]);
        let (mut tree, root) = FolderTree::build(&root_spec, None);
        let pool = pool_with(&["a.desktop", "b.desktop"]);
        tree.ensure_folder(&pool, root);
        assert_eq!(tree.node(root).entries, vec![EntryRef::File("a.desktop".into())]);
    }

    #[test]
    fn excludes_win_over_includes() {
        let mut root_spec = spec("Root", &["a.desktop"], vec![]);
        root_spec.excludes = vec!["a.desktop".to_string()];
        let (mut tree, root) = FolderTree::build(&root_spec, None);
        let pool = pool_with(&["a.desktop"]);
        tree.ensure_folder(&pool, root);
        assert!(tree.node(root).entries.is_empty());
    }

    #[test]
    fn subfolders_are_prepended() {
        let root_spec = spec("Root", &["a.desktop"], vec![spec("Games", &[], vec![])]);
        let (mut tree, root) = FolderTree::build(&root_spec, None);
        let pool = pool_with(&["a.desktop"]);
        tree.ensure_folder(&pool, root);
        assert!(matches!(tree.node(root).entries[0], EntryRef::Folder(_)));
    }

    #[test]
    fn invalidate_clears_ancestors() {
        let root_spec = spec("Root", &[], vec![spec("Games", &[], vec![])]);
        let (mut tree, root) = FolderTree::build(&root_spec, None);
        let pool = pool_with(&[]);
        let child = tree.node(root).subfolders[0];
        tree.ensure_folder(&pool, root);
        tree.ensure_folder(&pool, child);
        assert!(tree.node(root).up_to_date);
        assert!(tree.node(child).up_to_date);

        tree.invalidate(child);
        assert!(!tree.node(root).up_to_date);
        assert!(!tree.node(child).up_to_date);
    }

    #[test]
    fn append_and_remove_subfolder() {
        let root_spec = spec("Root", &[], vec![]);
        let (mut tree, root) = FolderTree::build(&root_spec, None);
        let games = tree.append_subfolder(root, &spec("Games", &[], vec![]));
        assert_eq!(tree.subfolder_named(root, "Games"), Some(games));
        tree.remove_subfolder(root, games);
        assert_eq!(tree.subfolder_named(root, "Games"), None);
    }

    #[test]
    fn export_round_trips_basic_shape() {
        let root_spec = spec("Root", &["a.desktop"], vec![spec("Games", &[], vec![])]);
        let (tree, root) = FolderTree::build(&root_spec, None);
        let exported = tree.export(root);
        assert_eq!(exported.name, "Root");
        assert_eq!(exported.subfolders.len(), 1);
        assert_eq!(exported.subfolders[0].name, "Games");
    }
}
