use std::{fmt, str::FromStr};

use pest::Parser;

use crate::{errors::{Error, Result},
            parsers::{Rule, ZfsParser}};

/// Parsed dataset name: `pool/fs@snapshot` or `pool/fs#bookmark`.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[get = "pub"]
pub struct DatasetName {
    pool: String,
    /// Everything before `@`/`#`.
    filesystem: String,
    snapshot: Option<String>,
    bookmark: Option<String>,
}

impl DatasetName {
    pub fn is_snapshot(&self) -> bool { self.snapshot.is_some() }

    pub fn is_bookmark(&self) -> bool { self.bookmark.is_some() }

    /// Parent filesystem name, `None` for a pool root.
    pub fn parent(&self) -> Option<&str> {
        if self.snapshot.is_some() || self.bookmark.is_some() {
            return Some(&self.filesystem);
        }
        self.filesystem.rfind('/').map(|idx| &self.filesystem[..idx])
    }
}

impl FromStr for DatasetName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let pairs =
            ZfsParser::parse(Rule::dataset_name, name).map_err(|_| Error::InvalidName(name.to_string()))?;
        let mut parsed = DatasetName {
            pool: String::new(),
            filesystem: String::new(),
            snapshot: None,
            bookmark: None,
        };
        for pair in pairs.flatten() {
            match pair.as_rule() {
                Rule::pool => parsed.pool = pair.as_str().to_string(),
                Rule::filesystem => parsed.filesystem = pair.as_str().to_string(),
                Rule::snapshot => parsed.snapshot = Some(pair.as_str()[1..].to_string()),
                Rule::bookmark => parsed.bookmark = Some(pair.as_str()[1..].to_string()),
                _ => {},
            }
        }
        Ok(parsed)
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filesystem)?;
        if let Some(snapshot) = &self.snapshot {
            write!(f, "@{}", snapshot)?;
        }
        if let Some(bookmark) = &self.bookmark {
            write!(f, "#{}", bookmark)?;
        }
        Ok(())
    }
}

/// Name helpers on anything string-like.
pub trait PathExt {
    fn get_pool(&self) -> Option<String>;
    fn get_snapshot(&self) -> Option<String>;
    fn get_bookmark(&self) -> Option<String>;

    fn is_snapshot(&self) -> bool { self.get_snapshot().is_some() }
    fn is_bookmark(&self) -> bool { self.get_bookmark().is_some() }
    fn is_volume_or_dataset(&self) -> bool { !self.is_bookmark() && !self.is_snapshot() }

    fn is_valid(&self) -> bool { self.validate().is_ok() }

    fn validate(&self) -> Result<DatasetName>;
}

impl<S: AsRef<str> + ?Sized> PathExt for S {
    fn get_pool(&self) -> Option<String> { self.validate().ok().map(|name| name.pool) }

    fn get_snapshot(&self) -> Option<String> { self.validate().ok().and_then(|name| name.snapshot) }

    fn get_bookmark(&self) -> Option<String> { self.validate().ok().and_then(|name| name.bookmark) }

    fn validate(&self) -> Result<DatasetName> { self.as_ref().parse() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_dataset_no_bookmarks_or_snapshots() {
        let path = "tank/usr/home";

        assert_eq!(Some(String::from("tank")), path.get_pool());
        assert!(!path.is_snapshot());
        assert!(!path.is_bookmark());
        assert!(path.is_volume_or_dataset());
        assert!(path.is_valid());
        assert_eq!(Some("tank/usr"), path.validate().unwrap().parent());
        assert_eq!(None, "tank".validate().unwrap().parent());
    }

    #[test]
    fn not_valid_just_dataset() {
        let path = String::from("/usr/home");
        assert_eq!(None, path.get_pool());
        assert!(!path.is_valid());
        assert_eq!(crate::errors::ErrorKind::InvalidName, path.validate().unwrap_err().kind());
    }

    #[test]
    fn valid_snapshot() {
        let name: DatasetName = "tank/usr/home@snap".parse().unwrap();

        assert_eq!("tank", name.pool());
        assert_eq!("tank/usr/home", name.filesystem());
        assert_eq!(&Some(String::from("snap")), name.snapshot());
        assert_eq!(Some("tank/usr/home"), name.parent());
        assert_eq!("tank/usr/home@snap", name.to_string());
    }

    #[test]
    fn valid_bookmark() {
        let path = "tank/usr/home#bookmark";

        assert!(!path.is_snapshot());
        assert!(path.is_bookmark());
        assert_eq!(Some(String::from("bookmark")), path.get_bookmark());
        assert!(!path.is_volume_or_dataset());
    }

    #[test]
    fn at_in_wrong_place() {
        let path = "tank/usr@wat/home";
        assert!(!path.is_snapshot());
        assert!(!path.is_valid());
    }
}
