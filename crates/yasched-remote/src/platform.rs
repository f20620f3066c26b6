//! Platform identification and flavor-aware remote paths.
//!
//! A node's platform is a list of tags ordered most-specific-first
//! (e.g. `debian-11, debian, debian-like, linux`); engines match on any
//! tag. The flavor decides path separators, quoting, and which shell
//! idioms the driver speaks.

/// Path and shell conventions of a remote platform family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFlavor {
    Posix,
    Windows,
}

impl PathFlavor {
    pub fn separator(self) -> char {
        match self {
            PathFlavor::Posix => '/',
            PathFlavor::Windows => '\\',
        }
    }

    pub fn is_absolute(self, path: &str) -> bool {
        match self {
            PathFlavor::Posix => path.starts_with('/'),
            // `C:\...` or a UNC path.
            PathFlavor::Windows => {
                path.starts_with("\\\\")
                    || (path.len() >= 3
                        && path.as_bytes()[1] == b':'
                        && (path.as_bytes()[2] == b'\\' || path.as_bytes()[2] == b'/'))
            }
        }
    }

    /// Join path components with the flavor's separator.
    pub fn join(self, base: &str, component: &str) -> String {
        let sep = self.separator();
        let base = base.trim_end_matches(['/', '\\']);
        let component = component.trim_start_matches(['/', '\\']);
        if base.is_empty() {
            return component.to_string();
        }
        let mut out = String::with_capacity(base.len() + component.len() + 1);
        out.push_str(base);
        out.push(sep);
        out.push_str(component);
        if self == PathFlavor::Windows {
            out.replace('/', "\\")
        } else {
            out
        }
    }

    /// Resolve a configured remote path: absolute verbatim, relative
    /// under the remote user's home.
    pub fn resolve(self, home: &str, configured: &str) -> String {
        if self.is_absolute(configured) {
            return configured.to_string();
        }
        let trimmed = configured
            .trim_start_matches("./")
            .trim_start_matches(".\\");
        self.join(home, trimmed)
    }

    /// Shell quoting for a single argument.
    pub fn quote(self, s: &str) -> String {
        match self {
            // Single quotes, with embedded quotes escaped the sh way.
            PathFlavor::Posix => format!("'{}'", s.replace('\'', r"'\''")),
            PathFlavor::Windows => format!("\"{}\"", s.replace('"', "`\"")),
        }
    }
}

/// Result of probing a node's operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Tags ordered most specific first.
    pub tags: Vec<String>,
    pub flavor: PathFlavor,
}

impl PlatformInfo {
    /// The most specific tag, used for logging and package decisions.
    pub fn primary(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or("unknown")
    }

    pub fn is_debian_like(&self) -> bool {
        self.tags.iter().any(|t| t == "debian-like")
    }
}

/// Tags for a Linux node from `/etc/os-release` fields
/// (`$ID`, `$ID_LIKE`, `$VERSION_ID`).
pub fn linux_tags(os_release: Option<(&str, &str, &str)>) -> Vec<String> {
    let mut tags = Vec::new();
    if let Some((id, id_like, version)) = os_release {
        if id == "debian" {
            if !version.is_empty() {
                tags.push(format!("debian-{version}"));
            }
            tags.push("debian".to_string());
        }
        if id == "debian" || id_like.split_whitespace().any(|x| x == "debian") {
            tags.push("debian-like".to_string());
        }
    }
    tags.push("linux".to_string());
    tags
}

/// Tags for a Windows node from the WMI OS caption.
pub fn windows_tags(caption: &str) -> Vec<String> {
    for version in ["12", "11", "10", "8", "7"] {
        if caption.contains(version) {
            return vec![format!("windows-{version}"), "windows".to_string()];
        }
    }
    vec!["windows".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_join_and_resolve() {
        let p = PathFlavor::Posix;
        assert_eq!(p.join("/data", "tasks"), "/data/tasks");
        assert_eq!(p.join("/data/", "/tasks"), "/data/tasks");
        assert_eq!(p.resolve("/root", "/data/tasks"), "/data/tasks");
        assert_eq!(p.resolve("/root", "./data/tasks"), "/root/data/tasks");
        assert_eq!(p.resolve("/root", "data"), "/root/data");
    }

    #[test]
    fn windows_join_uses_backslashes() {
        let w = PathFlavor::Windows;
        assert_eq!(w.join("C:\\data", "tasks/7"), "C:\\data\\tasks\\7");
        assert!(w.is_absolute("C:\\data"));
        assert!(w.is_absolute("C:/data"));
        assert!(w.is_absolute("\\\\share\\x"));
        assert!(!w.is_absolute("data\\tasks"));
        assert_eq!(
            w.resolve("C:\\Users\\worker", "data"),
            "C:\\Users\\worker\\data"
        );
        assert_eq!(w.resolve("C:\\Users\\worker", "D:\\scratch"), "D:\\scratch");
    }

    #[test]
    fn posix_quote_escapes_single_quotes() {
        let q = PathFlavor::Posix.quote("it's");
        assert_eq!(q, r"'it'\''s'");
    }

    #[test]
    fn debian_tags_most_specific_first() {
        let tags = linux_tags(Some(("debian", "", "11")));
        assert_eq!(tags, vec!["debian-11", "debian", "debian-like", "linux"]);
    }

    #[test]
    fn ubuntu_is_debian_like_but_not_debian() {
        let tags = linux_tags(Some(("ubuntu", "debian", "22.04")));
        assert_eq!(tags, vec!["debian-like", "linux"]);
    }

    #[test]
    fn unknown_linux_is_just_linux() {
        assert_eq!(linux_tags(None), vec!["linux"]);
        assert_eq!(linux_tags(Some(("alpine", "", "3.19"))), vec!["linux"]);
    }

    #[test]
    fn windows_caption_versions() {
        assert_eq!(
            windows_tags("Microsoft Windows 11 Pro"),
            vec!["windows-11", "windows"]
        );
        assert_eq!(
            windows_tags("Microsoft Windows 10 Enterprise"),
            vec!["windows-10", "windows"]
        );
        assert_eq!(windows_tags("Microsoft Windows Server"), vec!["windows"]);
    }
}
