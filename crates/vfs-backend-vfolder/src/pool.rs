//! The global pool of `.desktop`-style [`FileEntry`] records: one pool
//! loaded from the legacy merge directories, then the system item
//! directories, then the user item directory, later loaders overriding
//! earlier ones by basename.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Environment tags recognised by default when a `.desktop` entry carries
/// an `OnlyShowIn` key. Entries without the key are always kept; entries
/// that declare one are kept only if it names a recognised tag.
pub const DEFAULT_ENVIRONMENTS: &[&str] = &["VFS"];

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub filename: PathBuf,
    pub per_user: bool,
    pub keywords: HashSet<String>,
    pub implicit_keywords: bool,
}

#[derive(Debug, Default)]
pub struct Pool {
    entries: HashMap<String, FileEntry>,
}

impl Pool {
    /// Scan legacy merge dirs first, then the primary item dirs, then the
    /// user item dir; later scans override earlier ones by basename. Only
    /// merge-dir entries fall back to an implicit `Application` keyword
    /// when they carry no `Categories` key; item-dir entries without one
    /// keep an empty keyword set and match no keyword query.
    pub fn load(
        merge_dirs: &[PathBuf],
        item_dirs: &[PathBuf],
        user_item_dir: Option<&Path>,
        environments: &[String],
    ) -> Pool {
        let mut entries = HashMap::new();
        for dir in merge_dirs {
            scan_dir(dir, false, true, environments, &mut entries);
        }
        for dir in item_dirs {
            scan_dir(dir, false, false, environments, &mut entries);
        }
        if let Some(dir) = user_item_dir {
            scan_dir(dir, true, false, environments, &mut entries);
        }
        Pool { entries }
    }

    pub fn get(&self, basename: &str) -> Option<&FileEntry> {
        self.entries.get(basename)
    }

    pub fn contains(&self, basename: &str) -> bool {
        self.entries.contains_key(basename)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.entries.iter()
    }

    pub fn insert(&mut self, basename: String, entry: FileEntry) {
        self.entries.insert(basename, entry);
    }

    pub fn remove(&mut self, basename: &str) -> Option<FileEntry> {
        self.entries.remove(basename)
    }
}

fn scan_dir(
    dir: &Path,
    per_user: bool,
    is_merge_dir: bool,
    environments: &[String],
    entries: &mut HashMap<String, FileEntry>,
) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    for dir_entry in read_dir.flatten() {
        let path = dir_entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
            continue;
        }
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        let (categories, only_show_in) = parse_desktop_keys(&contents);
        if let Some(envs) = &only_show_in {
            if !envs.iter().any(|e| environments.iter().any(|tag| tag == e)) {
                continue;
            }
        }
        let (keywords, implicit_keywords) = match categories {
            Some(cats) if !cats.is_empty() => (cats.into_iter().collect(), false),
            _ if is_merge_dir => (HashSet::from(["Application".to_string()]), true),
            _ => (HashSet::new(), false),
        };
        entries.insert(
            basename.to_string(),
            FileEntry {
                filename: path,
                per_user,
                keywords,
                implicit_keywords,
            },
        );
    }
}

/// Parse the two keys the backend cares about out of a `.desktop`-style
/// key file: `Categories` and `OnlyShowIn`, both semicolon-separated.
fn parse_desktop_keys(contents: &str) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let mut categories = None;
    let mut only_show_in = None;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("Categories=") {
            categories = Some(split_list(value));
        } else if let Some(value) = line.strip_prefix("OnlyShowIn=") {
            only_show_in = Some(split_list(value));
        }
    }
    (categories, only_show_in)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Write a minimal `.desktop`-style file for `keywords`, preserving any
/// pre-existing lines other than `Categories=`.
pub fn write_entry_categories(path: &Path, keywords: &HashSet<String>) -> std::io::Result<()> {
    let mut ordered: Vec<&String> = keywords.iter().collect();
    ordered.sort();
    let categories_line = format!(
        "Categories={};",
        ordered
            .into_iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(";")
    );

    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

    if !lines.iter().any(|l| l.trim() == "[Desktop Entry]") {
        lines.insert(0, "[Desktop Entry]".to_string());
    }

    match lines.iter().position(|l| l.starts_with("Categories=")) {
        Some(idx) => lines[idx] = categories_line,
        None => {
            let header_idx = lines
                .iter()
                .position(|l| l.trim() == "[Desktop Entry]")
                .unwrap_or(0);
            lines.insert(header_idx + 1, categories_line);
        }
    }

    std::fs::write(path, lines.join("\n") + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn envs() -> Vec<String> {
        DEFAULT_ENVIRONMENTS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_categories_and_only_show_in() {
        let text = "[Desktop Entry]\nName=Foo\nCategories=Game;Network;\nOnlyShowIn=VFS;\n";
        let (cats, envs) = parse_desktop_keys(text);
        assert_eq!(cats.unwrap(), vec!["Game", "Network"]);
        assert_eq!(envs.unwrap(), vec!["VFS"]);
    }

    #[test]
    fn missing_keys_are_none() {
        let text = "[Desktop Entry]\nName=Foo\n";
        let (cats, envs) = parse_desktop_keys(text);
        assert!(cats.is_none());
        assert!(envs.is_none());
    }

    #[test]
    fn scan_dir_skips_entries_not_for_our_environment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hidden.desktop"),
            "[Desktop Entry]\nOnlyShowIn=GNOME;\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("shown.desktop"),
            "[Desktop Entry]\nCategories=Game;\n",
        )
        .unwrap();
        let pool = Pool::load(&[], &[dir.path().to_path_buf()], None, &envs());
        assert!(pool.get("hidden.desktop").is_none());
        assert!(pool.get("shown.desktop").is_some());
    }

    #[test]
    fn recognised_environment_tag_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("tagged.desktop"),
            "[Desktop Entry]\nOnlyShowIn=GNOME;\n",
        )
        .unwrap();
        let pool = Pool::load(
            &[],
            &[dir.path().to_path_buf()],
            None,
            &["GNOME".to_string()],
        );
        assert!(pool.get("tagged.desktop").is_some());
    }

    #[test]
    fn merge_dir_entry_without_categories_gets_implicit_keyword() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.desktop"), "[Desktop Entry]\nName=Old\n").unwrap();
        let pool = Pool::load(&[dir.path().to_path_buf()], &[], None, &envs());
        let entry = pool.get("old.desktop").unwrap();
        assert!(entry.implicit_keywords);
        assert!(entry.keywords.contains("Application"));
    }

    #[test]
    fn item_dir_entry_without_categories_stays_keywordless() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bare.desktop"), "[Desktop Entry]\nName=Bare\n").unwrap();
        let pool = Pool::load(&[], &[dir.path().to_path_buf()], None, &envs());
        let entry = pool.get("bare.desktop").unwrap();
        assert!(!entry.implicit_keywords);
        assert!(entry.keywords.is_empty());
    }

    #[test]
    fn user_dir_overrides_system_dir() {
        let system = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        fs::write(
            system.path().join("a.desktop"),
            "[Desktop Entry]\nCategories=System;\n",
        )
        .unwrap();
        fs::write(
            user.path().join("a.desktop"),
            "[Desktop Entry]\nCategories=User;\n",
        )
        .unwrap();
        let pool = Pool::load(&[], &[system.path().to_path_buf()], Some(user.path()), &envs());
        let entry = pool.get("a.desktop").unwrap();
        assert!(entry.keywords.contains("User"));
        assert!(entry.per_user);
    }

    #[test]
    fn write_entry_categories_preserves_other_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.desktop");
        fs::write(&path, "[Desktop Entry]\nName=Foo\nCategories=Old;\n").unwrap();
        let mut keywords = HashSet::new();
        keywords.insert("New".to_string());
        write_entry_categories(&path, &keywords).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Name=Foo"));
        assert!(text.contains("Categories=New;"));
        assert!(!text.contains("Old"));
    }

    #[test]
    fn write_entry_categories_creates_header_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.desktop");
        let mut keywords = HashSet::new();
        keywords.insert("New".to_string());
        write_entry_categories(&path, &keywords).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[Desktop Entry]"));
    }
}
