//! The vfolder configuration document: parsing and write-back for the
//! nested `VFolderInfo`/`Folder`/`Query` XML grammar.
//!
//! Parsed in two passes: first the raw markup is flattened into a generic
//! [`XmlNode`] tree, then [`parse_document`] walks that tree into the
//! domain types. `quick_xml`'s serde support doesn't model this grammar's
//! polymorphic `Query` children cleanly, so both the read and write side
//! work directly against `quick_xml`'s event API.

use std::io::Cursor;
use std::path::PathBuf;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::query::{Query, QueryNode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("xml error: {0}")]
    Xml(String),
    #[error("malformed vfolder document: {0}")]
    Malformed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    pub merge_dirs: Vec<PathBuf>,
    pub item_dirs: Vec<PathBuf>,
    pub user_item_dir: Option<PathBuf>,
    pub desktop_dir: Option<PathBuf>,
    pub user_desktop_dir: Option<PathBuf>,
    pub read_only: bool,
    pub root: FolderSpec,
}

#[derive(Debug, Clone, Default)]
pub struct FolderSpec {
    pub name: String,
    pub desktop_file: Option<String>,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub query: Option<Query>,
    pub subfolders: Vec<FolderSpec>,
    pub read_only: bool,
    pub dont_show_if_empty: bool,
}

// ---------------------------------------------------------------------------
// Generic XML tree (read side)
// ---------------------------------------------------------------------------

struct XmlNode {
    tag: String,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.tag == tag)
    }
}

fn parse_xml_tree(input: &str) -> Result<XmlNode, ConfigError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack = vec![XmlNode {
        tag: "#root".to_string(),
        text: String::new(),
        children: Vec::new(),
    }];
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| ConfigError::Xml(e.to_string()))?
        {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(XmlNode {
                    tag,
                    text: String::new(),
                    children: Vec::new(),
                });
            }
            Event::Empty(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack
                    .last_mut()
                    .ok_or_else(|| ConfigError::Xml("element outside the document root".to_string()))?
                    .children
                    .push(XmlNode {
                        tag,
                        text: String::new(),
                        children: Vec::new(),
                    });
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| ConfigError::Xml(e.to_string()))?
                    .into_owned();
                stack
                    .last_mut()
                    .ok_or_else(|| ConfigError::Xml("text outside the document root".to_string()))?
                    .text
                    .push_str(&text);
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| {
                    ConfigError::Xml("unbalanced closing tag".to_string())
                })?;
                stack
                    .last_mut()
                    .ok_or_else(|| ConfigError::Xml("unbalanced closing tag".to_string()))?
                    .children
                    .push(node);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let root = stack.pop().ok_or_else(|| ConfigError::Xml("empty document".to_string()))?;
    root.children
        .into_iter()
        .next()
        .ok_or_else(|| ConfigError::Malformed("no top-level element".to_string()))
}

pub fn parse_document(text: &str) -> Result<Document, ConfigError> {
    let root = parse_xml_tree(text)?;
    if root.tag != "VFolderInfo" {
        return Err(ConfigError::Malformed(format!(
            "expected <VFolderInfo>, found <{}>",
            root.tag
        )));
    }

    let folder_node = root
        .child("Folder")
        .ok_or_else(|| ConfigError::Malformed("<VFolderInfo> has no <Folder>".to_string()))?;

    Ok(Document {
        merge_dirs: root
            .children_named("MergeDir")
            .map(|n| PathBuf::from(expand_home(&n.text)))
            .collect(),
        item_dirs: root
            .children_named("ItemDir")
            .map(|n| PathBuf::from(expand_home(&n.text)))
            .collect(),
        user_item_dir: root
            .child("UserItemDir")
            .map(|n| PathBuf::from(expand_home(&n.text))),
        desktop_dir: root
            .child("DesktopDir")
            .map(|n| PathBuf::from(expand_home(&n.text))),
        user_desktop_dir: root
            .child("UserDesktopDir")
            .map(|n| PathBuf::from(expand_home(&n.text))),
        read_only: root.child("ReadOnly").is_some(),
        root: parse_folder(folder_node)?,
    })
}

fn parse_folder(node: &XmlNode) -> Result<FolderSpec, ConfigError> {
    let name = node
        .child("Name")
        .map(|n| n.text.clone())
        .ok_or_else(|| ConfigError::Malformed("<Folder> has no <Name>".to_string()))?;

    let query = match node.child("Query") {
        Some(q) => q.children.first().map(parse_query),
        None => None,
    };

    let subfolders = node
        .children_named("Folder")
        .map(parse_folder)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FolderSpec {
        name,
        desktop_file: node.child("Desktop").map(|n| n.text.clone()),
        includes: node.children_named("Include").map(|n| n.text.clone()).collect(),
        excludes: node.children_named("Exclude").map(|n| n.text.clone()).collect(),
        query,
        subfolders,
        read_only: node.child("ReadOnly").is_some(),
        dont_show_if_empty: node.child("DontShowIfEmpty").is_some(),
    })
}

fn parse_query(node: &XmlNode) -> Query {
    match node.tag.as_str() {
        "And" => Query {
            node: QueryNode::And(node.children.iter().map(parse_query).collect()),
            not: false,
        },
        "Or" => Query {
            node: QueryNode::Or(node.children.iter().map(parse_query).collect()),
            not: false,
        },
        "Keyword" => Query {
            node: QueryNode::Keyword(node.text.clone()),
            not: false,
        },
        "Filename" => Query {
            node: QueryNode::Filename(node.text.clone()),
            not: false,
        },
        "Not" => {
            let mut inner = node
                .children
                .first()
                .map(parse_query)
                .unwrap_or(Query {
                    node: QueryNode::Or(Vec::new()),
                    not: false,
                });
            inner.not = !inner.not;
            inner
        }
        // Unrecognised node: constant-false, like a missing query.
        _ => Query {
            node: QueryNode::Or(Vec::new()),
            not: false,
        },
    }
}

fn expand_home(text: &str) -> String {
    if let Some(rest) = text.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), rest);
        }
    }
    text.to_string()
}

// ---------------------------------------------------------------------------
// Write-back
// ---------------------------------------------------------------------------

pub fn write_document(doc: &Document) -> Result<String, ConfigError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Start(BytesStart::new("VFolderInfo")))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;

    for dir in &doc.merge_dirs {
        write_text_element(&mut writer, "MergeDir", &dir.to_string_lossy())?;
    }
    for dir in &doc.item_dirs {
        write_text_element(&mut writer, "ItemDir", &dir.to_string_lossy())?;
    }
    if let Some(dir) = &doc.user_item_dir {
        write_text_element(&mut writer, "UserItemDir", &dir.to_string_lossy())?;
    }
    if let Some(dir) = &doc.desktop_dir {
        write_text_element(&mut writer, "DesktopDir", &dir.to_string_lossy())?;
    }
    if let Some(dir) = &doc.user_desktop_dir {
        write_text_element(&mut writer, "UserDesktopDir", &dir.to_string_lossy())?;
    }
    if doc.read_only {
        write_empty_element(&mut writer, "ReadOnly")?;
    }

    write_folder(&mut writer, &doc.root)?;

    writer
        .write_event(Event::End(BytesEnd::new("VFolderInfo")))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| ConfigError::Xml(e.to_string()))
}

fn write_folder(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    folder: &FolderSpec,
) -> Result<(), ConfigError> {
    writer
        .write_event(Event::Start(BytesStart::new("Folder")))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;

    write_text_element(writer, "Name", &folder.name)?;
    if let Some(desktop) = &folder.desktop_file {
        write_text_element(writer, "Desktop", desktop)?;
    }
    for include in &folder.includes {
        write_text_element(writer, "Include", include)?;
    }
    for exclude in &folder.excludes {
        write_text_element(writer, "Exclude", exclude)?;
    }
    if let Some(query) = &folder.query {
        writer
            .write_event(Event::Start(BytesStart::new("Query")))
            .map_err(|e| ConfigError::Xml(e.to_string()))?;
        write_query(writer, query)?;
        writer
            .write_event(Event::End(BytesEnd::new("Query")))
            .map_err(|e| ConfigError::Xml(e.to_string()))?;
    }
    for subfolder in &folder.subfolders {
        write_folder(writer, subfolder)?;
    }
    if folder.read_only {
        write_empty_element(writer, "ReadOnly")?;
    }
    if folder.dont_show_if_empty {
        write_empty_element(writer, "DontShowIfEmpty")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Folder")))
        .map_err(|e| ConfigError::Xml(e.to_string()))
}

fn write_query(writer: &mut Writer<Cursor<Vec<u8>>>, query: &Query) -> Result<(), ConfigError> {
    if query.not {
        writer
            .write_event(Event::Start(BytesStart::new("Not")))
            .map_err(|e| ConfigError::Xml(e.to_string()))?;
        write_query(
            writer,
            &Query {
                node: query.node.clone(),
                not: false,
            },
        )?;
        return writer
            .write_event(Event::End(BytesEnd::new("Not")))
            .map_err(|e| ConfigError::Xml(e.to_string()));
    }

    match &query.node {
        QueryNode::And(children) => {
            writer
                .write_event(Event::Start(BytesStart::new("And")))
                .map_err(|e| ConfigError::Xml(e.to_string()))?;
            for child in children {
                write_query(writer, child)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("And")))
                .map_err(|e| ConfigError::Xml(e.to_string()))
        }
        QueryNode::Or(children) => {
            writer
                .write_event(Event::Start(BytesStart::new("Or")))
                .map_err(|e| ConfigError::Xml(e.to_string()))?;
            for child in children {
                write_query(writer, child)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("Or")))
                .map_err(|e| ConfigError::Xml(e.to_string()))
        }
        QueryNode::Keyword(k) => write_text_element(writer, "Keyword", k),
        QueryNode::Filename(n) => write_text_element(writer, "Filename", n),
    }
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    text: &str,
) -> Result<(), ConfigError> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|e| ConfigError::Xml(e.to_string()))?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|e| ConfigError::Xml(e.to_string()))
}

fn write_empty_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
) -> Result<(), ConfigError> {
    writer
        .write_event(Event::Empty(BytesStart::new(tag)))
        .map_err(|e| ConfigError::Xml(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<VFolderInfo>
  <ItemDir>/usr/share/applications</ItemDir>
  <UserItemDir>~/.local/share/applications</UserItemDir>
  <Folder>
    <Name>Root</Name>
    <Include>always.desktop</Include>
    <Query>
      <Or>
        <Keyword>Game</Keyword>
        <Not><Filename>skip.desktop</Filename></Not>
      </Or>
    </Query>
    <Folder>
      <Name>Games</Name>
      <Exclude>hidden.desktop</Exclude>
      <ReadOnly/>
    </Folder>
  </Folder>
</VFolderInfo>"#;

    #[test]
    fn parses_top_level_dirs() {
        let doc = parse_document(SAMPLE).unwrap();
        assert_eq!(doc.item_dirs, vec![PathBuf::from("/usr/share/applications")]);
        assert!(doc.user_item_dir.is_some());
    }

    #[test]
    fn parses_nested_folder() {
        let doc = parse_document(SAMPLE).unwrap();
        assert_eq!(doc.root.name, "Root");
        assert_eq!(doc.root.includes, vec!["always.desktop"]);
        assert_eq!(doc.root.subfolders.len(), 1);
        assert_eq!(doc.root.subfolders[0].name, "Games");
        assert!(doc.root.subfolders[0].read_only);
        assert_eq!(doc.root.subfolders[0].excludes, vec!["hidden.desktop"]);
    }

    #[test]
    fn parses_query_with_or_and_not() {
        let doc = parse_document(SAMPLE).unwrap();
        let query = doc.root.query.unwrap();
        match query.node {
            QueryNode::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(children[1].not);
            }
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_root_element() {
        assert!(parse_document("<NotAVFolder/>").is_err());
    }

    #[test]
    fn write_then_parse_round_trips_structure() {
        let doc = parse_document(SAMPLE).unwrap();
        let text = write_document(&doc).unwrap();
        let reparsed = parse_document(&text).unwrap();
        assert_eq!(reparsed.root.name, doc.root.name);
        assert_eq!(reparsed.root.subfolders.len(), doc.root.subfolders.len());
        assert_eq!(reparsed.item_dirs, doc.item_dirs);
    }
}
