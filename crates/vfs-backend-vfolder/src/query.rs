//! Boolean predicates over [`crate::pool::FileEntry`] keywords and
//! filenames, evaluated while materialising a folder.

use crate::pool::FileEntry;

#[derive(Debug, Clone)]
pub enum QueryNode {
    And(Vec<Query>),
    Or(Vec<Query>),
    Keyword(String),
    Filename(String),
}

#[derive(Debug, Clone)]
pub struct Query {
    pub node: QueryNode,
    pub not: bool,
}

impl Query {
    pub fn eval(&self, basename: &str, entry: &FileEntry) -> bool {
        let result = match &self.node {
            QueryNode::And(children) => children.iter().all(|c| c.eval(basename, entry)),
            QueryNode::Or(children) => children.iter().any(|c| c.eval(basename, entry)),
            QueryNode::Keyword(k) => entry.keywords.contains(k),
            QueryNode::Filename(n) => basename == n,
        };
        result != self.not
    }
}
