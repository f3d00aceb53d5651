//! 文件操作工具：read_file / write_file / edit_file / list_dir / search_files
//!
//! 路径相对于工作区根解析；安全限制由策略引擎负责，这里只做 IO。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use walkdir::WalkDir;

use crate::tools::registry::{ArgSpec, ArgType, SideEffect, Tool, ToolDescriptor};

/// search_files 返回的最大匹配行数
const MAX_SEARCH_HITS: usize = 200;
/// search_files 跳过超过该大小的文件
const MAX_SEARCH_FILE_BYTES: u64 = 1_048_576;
/// 搜索与列目录时跳过的目录名
const SKIP_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
];

fn resolve(root: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        root.join(p)
    }
}

fn arg_str<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFileTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "read_file",
                description: "Read the contents of a file.",
                args: vec![ArgSpec::required("path", ArgType::String, "file path")],
                output_limit: 8192,
                side_effect: SideEffect::Read,
            },
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let path = resolve(&self.root, arg_str(args, "path"));
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "write_file",
                description: "Write content to a file, creating parent directories as needed. Overwrites existing content.",
                args: vec![
                    ArgSpec::required("path", ArgType::String, "file path"),
                    ArgSpec::required("content", ArgType::String, "full file content"),
                ],
                output_limit: 2048,
                side_effect: SideEffect::Write,
            },
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let path = resolve(&self.root, arg_str(args, "path"));
        let content = arg_str(args, "content");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
    }
}

// ---------------------------------------------------------------------------
// edit_file
// ---------------------------------------------------------------------------

pub struct EditFileTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl EditFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "edit_file",
                description: "Replace every occurrence of `find` with `replace` in a file.",
                args: vec![
                    ArgSpec::required("path", ArgType::String, "file path"),
                    ArgSpec::required("find", ArgType::String, "exact text to find"),
                    ArgSpec::required("replace", ArgType::String, "replacement text"),
                ],
                output_limit: 2048,
                side_effect: SideEffect::Write,
            },
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let path = resolve(&self.root, arg_str(args, "path"));
        let find = arg_str(args, "find");
        let replace = arg_str(args, "replace");

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let count = content.matches(find).count();
        if count == 0 {
            return Err(format!(
                "`find` text not found in {}. Read the file first and copy the exact text.",
                path.display()
            ));
        }
        let updated = content.replace(find, replace);
        tokio::fs::write(&path, updated)
            .await
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        Ok(format!(
            "Replaced {} occurrence(s) in {}",
            count,
            path.display()
        ))
    }
}

// ---------------------------------------------------------------------------
// list_dir
// ---------------------------------------------------------------------------

pub struct ListDirTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl ListDirTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "list_dir",
                description: "List entries of a directory. Directories are suffixed with '/'.",
                args: vec![
                    ArgSpec::required("path", ArgType::String, "directory path"),
                    ArgSpec::optional("glob", ArgType::String, "filter entries by glob, e.g. *.rs"),
                ],
                output_limit: 2048,
                side_effect: SideEffect::Read,
            },
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let path = resolve(&self.root, arg_str(args, "path"));
        let filter = arg_str(args, "glob");
        let pattern = if filter.is_empty() {
            None
        } else {
            Some(glob::Pattern::new(filter).map_err(|e| format!("bad glob '{}': {}", filter, e))?)
        };

        let mut read = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("cannot list {}: {}", path.display(), e))?;
        let mut entries = Vec::new();
        while let Some(entry) = read
            .next_entry()
            .await
            .map_err(|e| format!("cannot list {}: {}", path.display(), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(p) = &pattern {
                if !p.matches(&name) {
                    continue;
                }
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            Ok("(empty)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

// ---------------------------------------------------------------------------
// search_files
// ---------------------------------------------------------------------------

pub struct SearchFilesTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl SearchFilesTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            descriptor: ToolDescriptor {
                name: "search_files",
                description: "Search file contents under a directory. Returns `path:line: text` matches.",
                args: vec![
                    ArgSpec::required("pattern", ArgType::String, "text or regex to search for"),
                    ArgSpec::required("path", ArgType::String, "directory to search in"),
                    ArgSpec::optional("is_regex", ArgType::Boolean, "treat pattern as a regex (default false)"),
                ],
                output_limit: 2048,
                side_effect: SideEffect::Read,
            },
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: &Value) -> Result<String, String> {
        let base = resolve(&self.root, arg_str(args, "path"));
        let pattern = arg_str(args, "pattern").to_string();
        if pattern.is_empty() {
            return Err("empty search pattern".into());
        }
        let is_regex = args
            .get("is_regex")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let regex = if is_regex {
            Some(regex::Regex::new(&pattern).map_err(|e| format!("bad regex: {}", e))?)
        } else {
            None
        };

        // 文件遍历是同步 IO，放到阻塞线程池
        let hits = tokio::task::spawn_blocking(move || search_sync(&base, &pattern, regex))
            .await
            .map_err(|e| format!("search task failed: {}", e))??;

        if hits.is_empty() {
            Ok("no matches".to_string())
        } else {
            Ok(hits.join("\n"))
        }
    }
}

fn search_sync(
    base: &Path,
    pattern: &str,
    regex: Option<regex::Regex>,
) -> Result<Vec<String>, String> {
    let mut hits = Vec::new();
    let walker = WalkDir::new(base).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !SKIP_DIRS.contains(&name.as_ref())
    });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_SEARCH_FILE_BYTES {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue; // 二进制或不可读文件
        };
        let rel = entry
            .path()
            .strip_prefix(base)
            .unwrap_or(entry.path())
            .display();
        let rel = rel.to_string();
        for (lineno, line) in content.lines().enumerate() {
            let matched = match &regex {
                Some(re) => re.is_match(line),
                None => line.contains(pattern),
            };
            if matched {
                hits.push(format!("{}:{}: {}", rel, lineno + 1, line.trim_end()));
                if hits.len() >= MAX_SEARCH_HITS {
                    hits.push(format!("(stopped after {} matches)", MAX_SEARCH_HITS));
                    return Ok(hits);
                }
            }
        }
    }
    Ok(hits)
}
