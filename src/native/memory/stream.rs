//! Text stream format written by the in-memory `send` and read back by `receive`.
//!
//! ```text
//! MEMSTREAM	1
//! name	tank/fs
//! kind	filesystem
//! from	snap1	1234
//! origin	tank/base@snap
//! snapshot	snap2	5678
//! prop	compression	lz4
//! end
//! ```
use crate::zfs::DatasetType;

const MAGIC: &str = "MEMSTREAM\t1";

#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct Stream {
    /// Filesystem the stream was sent from.
    pub name: String,
    pub kind: DatasetType,
    /// Incremental source, short snapshot name and guid.
    pub from: Option<(String, u64)>,
    /// Full name of the origin snapshot for a clone.
    pub origin: Option<String>,
    /// Short names and guids, oldest first. Empty for a send of the live filesystem.
    pub snapshots: Vec<(String, u64)>,
    pub props: Vec<(String, String)>,
}

impl Stream {
    pub fn encode(&self) -> String {
        let mut out = format!("{}\nname\t{}\nkind\t{}\n", MAGIC, self.name, self.kind.name());
        if let Some((from, guid)) = &self.from {
            out.push_str(&format!("from\t{}\t{}\n", from, guid));
        }
        if let Some(origin) = &self.origin {
            out.push_str(&format!("origin\t{}\n", origin));
        }
        for (snapshot, guid) in &self.snapshots {
            out.push_str(&format!("snapshot\t{}\t{}\n", snapshot, guid));
        }
        for (name, value) in &self.props {
            out.push_str(&format!("prop\t{}\t{}\n", name, value));
        }
        out.push_str("end\n");
        out
    }

    /// `None` for anything that isn't a complete stream.
    pub fn decode(text: &str) -> Option<Stream> {
        let mut lines = text.lines();
        if lines.next()? != MAGIC {
            return None;
        }
        let mut stream = Stream::default();
        let mut complete = false;
        for line in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.as_slice() {
                ["name", name] => stream.name = name.to_string(),
                ["kind", "volume"] => stream.kind = DatasetType::VOLUME,
                ["kind", "filesystem"] => stream.kind = DatasetType::FILESYSTEM,
                ["from", name, guid] => stream.from = Some((name.to_string(), guid.parse().ok()?)),
                ["origin", origin] => stream.origin = Some(origin.to_string()),
                ["snapshot", name, guid] => stream.snapshots.push((name.to_string(), guid.parse().ok()?)),
                ["prop", name, value] => stream.props.push((name.to_string(), value.to_string())),
                ["end"] => {
                    complete = true;
                    break;
                },
                _ => return None,
            }
        }
        if complete && !stream.name.is_empty() && !stream.kind.is_empty() {
            Some(stream)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn incremental_stream() {
        let stream = Stream {
            name: "tank/fs".into(),
            kind: DatasetType::FILESYSTEM,
            from: Some(("a".into(), 7)),
            origin: None,
            snapshots: vec![("b".into(), 8), ("c".into(), 9)],
            props: vec![("compression".into(), "lz4".into())],
        };
        assert_eq!(Some(stream.clone()), Stream::decode(&stream.encode()));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let text = "MEMSTREAM\t1\nname\ttank/fs\nkind\tfilesystem\n";
        assert_eq!(None, Stream::decode(text));
        assert_eq!(None, Stream::decode("garbage"));
        assert_eq!(None, Stream::decode(""));
    }
}
