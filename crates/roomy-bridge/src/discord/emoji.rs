use std::fmt;

use roomy_bridge_core::id::Snowflake;

/// A Discord emoji as used in reactions: either plain unicode or a custom
/// guild emoji.
///
/// Custom emoji travel through Roomy in Discord's message notation
/// (`<:name:id>`, animated `<a:name:id>`); unicode emoji pass through as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscordEmoji {
    Unicode(String),
    Custom {
        name: String,
        id: Snowflake,
        animated: bool,
    },
}

impl DiscordEmoji {
    /// The key component of reaction mapping keys: the custom emoji
    /// snowflake if present, else the unicode string.
    pub fn key(&self) -> String {
        match self {
            DiscordEmoji::Unicode(s) => s.clone(),
            DiscordEmoji::Custom { id, .. } => id.to_string(),
        }
    }

    /// Parse the wire form; anything that is not a well-formed custom-emoji
    /// tag is treated as unicode.
    pub fn parse(s: &str) -> Self {
        let Some(inner) = s.strip_prefix('<').and_then(|r| r.strip_suffix('>')) else {
            return DiscordEmoji::Unicode(s.to_owned());
        };
        let (animated, rest) = match inner.strip_prefix("a:") {
            Some(rest) => (true, rest),
            None => match inner.strip_prefix(':') {
                Some(rest) => (false, rest),
                None => return DiscordEmoji::Unicode(s.to_owned()),
            },
        };
        let Some((name, id)) = rest.split_once(':') else {
            return DiscordEmoji::Unicode(s.to_owned());
        };
        let Ok(id) = id.parse::<Snowflake>() else {
            return DiscordEmoji::Unicode(s.to_owned());
        };
        if name.is_empty() {
            return DiscordEmoji::Unicode(s.to_owned());
        }
        DiscordEmoji::Custom {
            name: name.to_owned(),
            id,
            animated,
        }
    }
}

impl fmt::Display for DiscordEmoji {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscordEmoji::Unicode(s) => f.write_str(s),
            DiscordEmoji::Custom { name, id, animated } => {
                if *animated {
                    write!(f, "<a:{name}:{id}>")
                } else {
                    write!(f, "<:{name}:{id}>")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicode_roundtrip() {
        let emoji = DiscordEmoji::parse("👍");
        assert_eq!(emoji, DiscordEmoji::Unicode("👍".to_owned()));
        assert_eq!(emoji.to_string(), "👍");
        assert_eq!(emoji.key(), "👍");
    }

    #[test]
    fn custom_roundtrip() {
        let emoji = DiscordEmoji::parse("<:blob:12345>");
        assert_eq!(
            emoji,
            DiscordEmoji::Custom {
                name: "blob".to_owned(),
                id: Snowflake::new(12345),
                animated: false,
            }
        );
        assert_eq!(emoji.to_string(), "<:blob:12345>");
        assert_eq!(emoji.key(), "12345");
    }

    #[test]
    fn animated_custom_roundtrip() {
        let emoji = DiscordEmoji::parse("<a:party:67890>");
        assert_eq!(
            emoji,
            DiscordEmoji::Custom {
                name: "party".to_owned(),
                id: Snowflake::new(67890),
                animated: true,
            }
        );
        assert_eq!(emoji.to_string(), "<a:party:67890>");
    }

    #[test]
    fn malformed_tags_fall_back_to_unicode() {
        for s in ["<:missing-id:>", "<::1>", "<a:x>", "<junk>", "::"] {
            assert_eq!(DiscordEmoji::parse(s), DiscordEmoji::Unicode(s.to_owned()));
        }
    }
}
