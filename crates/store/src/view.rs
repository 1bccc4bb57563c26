use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};

/// A snapshot of an editor buffer.
///
/// An empty `src` means "not loaded": readers fall back to the file on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct View {
    pub path: PathBuf,
    pub wd: PathBuf,
    pub name: String,
    pub hash: String,
    #[serde(with = "src_bytes")]
    pub src: Vec<u8>,
    pub pos: usize,
    pub row: usize,
    pub col: usize,
    pub dirty: bool,
    pub ext: String,
    pub lang: String,
}

impl View {
    pub fn new(path: impl Into<PathBuf>, src: impl Into<Vec<u8>>) -> Self {
        let mut v = Self {
            path: path.into(),
            src: src.into(),
            ..Default::default()
        };
        v.finalize();
        v
    }

    /// Fills the derived fields: name, directory, extension, language,
    /// content hash, and the cursor's row and column.
    pub fn finalize(&mut self) {
        if !self.path.as_os_str().is_empty() {
            if let Some(name) = self.path.file_name() {
                self.name = name.to_string_lossy().into_owned();
            }
            if self.wd.as_os_str().is_empty() {
                if let Some(dir) = self.path.parent() {
                    self.wd = dir.to_path_buf();
                }
            }
        }
        if self.ext.is_empty() {
            self.ext = Path::new(&self.name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
        }
        if self.lang.is_empty() {
            self.lang = lang_for(&self.name, &self.ext).to_string();
        }
        if !self.src.is_empty() {
            self.hash = src_hash(&self.src);
        }
        self.pos = self.pos.min(self.src.len());
        let (row, col) = row_col(&self.src, self.pos);
        self.row = row;
        self.col = col;
    }

    pub fn dir(&self) -> &Path {
        if !self.wd.as_os_str().is_empty() {
            return &self.wd;
        }
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn filename(&self) -> PathBuf {
        if !self.path.as_os_str().is_empty() {
            return self.path.clone();
        }
        self.dir().join(&self.name)
    }

    pub fn lang_is(&self, langs: &[&str]) -> bool {
        langs.iter().any(|l| *l == self.lang)
    }

    /// The buffer contents, or the file on disk when none were sent.
    pub fn read_all(&self) -> io::Result<Cow<'_, [u8]>> {
        if !self.src.is_empty() {
            return Ok(Cow::Borrowed(&self.src));
        }
        if self.path.as_os_str().is_empty() {
            return Ok(Cow::Borrowed(&[]));
        }
        std::fs::read(&self.path).map(Cow::Owned)
    }

    /// Opens a reader over [`View::read_all`].
    pub fn open(&self) -> io::Result<Box<dyn io::Read + '_>> {
        match self.read_all()? {
            Cow::Borrowed(b) => Ok(Box::new(b)),
            Cow::Owned(b) => Ok(Box::new(io::Cursor::new(b))),
        }
    }

    /// Returns a copy holding `src`, marked dirty, with the cursor clamped.
    pub fn set_src(&self, src: impl Into<Vec<u8>>) -> Self {
        let mut v = self.clone();
        v.src = src.into();
        v.hash = src_hash(&v.src);
        v.dirty = true;
        v.finalize();
        v
    }

    /// The byte offset of the character index `char_pos` in this view's source.
    pub fn byte_pos(&self, char_pos: usize) -> usize {
        byte_pos(&self.src, char_pos)
    }
}

/// Maps a character index to a byte offset in UTF-8 `src`, clamped to the end.
pub fn byte_pos(src: &[u8], char_pos: usize) -> usize {
    src.iter()
        .enumerate()
        .filter(|(_, b)| (**b & 0xC0) != 0x80)
        .map(|(i, _)| i)
        .nth(char_pos)
        .unwrap_or(src.len())
}

/// Zero-based row and character column of byte offset `pos`.
pub fn row_col(src: &[u8], pos: usize) -> (usize, usize) {
    let head = &src[..pos.min(src.len())];
    let row = head.iter().filter(|b| **b == b'\n').count();
    let line_start = head.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let col = String::from_utf8_lossy(&head[line_start..]).chars().count();
    (row, col)
}

/// A content-addressed identifier of `src`.
pub fn src_hash(src: &[u8]) -> String {
    let digest = Sha512::digest(src);
    format!("hash:sha512;base64url,{}", URL_SAFE.encode(digest))
}

fn lang_for(name: &str, ext: &str) -> &'static str {
    match name {
        "go.mod" => return "go.mod",
        "go.sum" => return "go.sum",
        _ => {}
    }
    match ext {
        ".go" => "go",
        ".rs" => "rust",
        ".py" => "python",
        ".js" | ".mjs" => "js",
        ".ts" => "ts",
        ".json" => "json",
        ".md" => "md",
        ".html" | ".htm" => "html",
        ".tmpl" | ".gohtml" => "go-template",
        _ => "",
    }
}

/// Source bytes travel as base64 text in human-readable formats and as raw
/// bytes elsewhere.
mod src_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(src: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&STANDARD.encode(src))
        } else {
            s.serialize_bytes(src)
        }
    }

    struct SrcVisitor;

    impl<'de> Visitor<'de> for SrcVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("base64 text or a byte string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            STANDARD.decode(v).map_err(E::custom)
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Vec<u8>, E> {
            Ok(Vec::new())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        if d.is_human_readable() {
            d.deserialize_any(SrcVisitor)
        } else {
            d.deserialize_bytes(SrcVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn char_positions_map_to_utf8_byte_offsets() {
        let src = "…x".as_bytes();
        assert_eq!(byte_pos(src, 0), 0);
        assert_eq!(byte_pos(src, 1), 3);
        assert_eq!(byte_pos(src, 2), 4);
        assert_eq!(byte_pos(src, 9), 4);
    }

    #[test]
    fn finalize_derives_name_lang_and_cursor() {
        let mut v = View {
            path: PathBuf::from("/src/app/main.go"),
            src: b"package main\n\nfunc \xE2\x80\xA6() {}\n".to_vec(),
            pos: 17,
            ..Default::default()
        };
        v.finalize();
        assert_eq!(v.name, "main.go");
        assert_eq!(v.ext, ".go");
        assert_eq!(v.lang, "go");
        assert_eq!(v.dir(), Path::new("/src/app"));
        assert_eq!((v.row, v.col), (2, 3));
        assert!(v.hash.starts_with("hash:sha512;base64url,"));
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(src_hash(b"abc"), src_hash(b"abc"));
        assert_ne!(src_hash(b"abc"), src_hash(b"abd"));
    }

    #[test]
    fn set_src_marks_dirty_and_rehashes() {
        let v = View::new("/x/a.go", "package a\n");
        let w = v.set_src("package b\n");
        assert!(!v.dirty);
        assert!(w.dirty);
        assert_ne!(v.hash, w.hash);
    }

    #[test]
    fn read_all_falls_back_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.go");
        std::fs::write(&path, "package f\n").unwrap();

        let on_disk = View::new(&path, Vec::new());
        assert_eq!(&*on_disk.read_all().unwrap(), b"package f\n");

        let buffered = View::new(&path, "package g\n");
        let mut s = String::new();
        buffered.open().unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "package g\n");
    }

    #[test]
    fn src_is_base64_in_json() {
        let v = View::new("/a.go", "hi");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["Src"], "aGk=");
        let back: View = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
