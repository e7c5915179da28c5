use std::fmt;
use std::sync::OnceLock;

use regex_lite::{Regex, RegexBuilder};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub fn from_secs(seconds: u64) -> Self {
        Self(std::time::Duration::from_secs(seconds))
    }

    fn parse(v: &str) -> Option<Result<Self, String>> {
        static REGEXP: OnceLock<Regex> = OnceLock::new();

        let regexp = REGEXP.get_or_init(|| {
            RegexBuilder::new(
                r"
                ^
                (?:(?<days>    \d+)d)? \s*
                (?:(?<hours>   \d+)h)? \s*
                (?:(?<minutes> \d+)m)? \s*
                (?:(?<seconds> \d+)s)?
                $",
            )
            .ignore_whitespace(true)
            .build()
            .expect("the duration regexp is valid")
        });
        let captures = regexp.captures(v.trim())?;

        let parse = |name: &str| -> Result<Option<u64>, String> {
            match captures.name(name).map(|m| m.as_str()) {
                Some(s) => s
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| format!("could not parse {name} (`{s}`): {e}")),

                None => Ok(None),
            }
        };

        let parts = (|| {
            Ok::<_, String>([
                parse("days")?,
                parse("hours")?,
                parse("minutes")?,
                parse("seconds")?,
            ])
        })();
        let [days, hours, minutes, seconds] = match parts {
            Ok(parts) => parts,
            Err(e) => return Some(Err(e)),
        };

        if days.is_none() && hours.is_none() && minutes.is_none() && seconds.is_none() {
            return None;
        }

        Some(
            days.unwrap_or(0)
                .checked_mul(24)
                .and_then(|h| h.checked_add(hours.unwrap_or(0)))
                .and_then(|h| h.checked_mul(60))
                .and_then(|m| m.checked_add(minutes.unwrap_or(0)))
                .and_then(|m| m.checked_mul(60))
                .and_then(|s| s.checked_add(seconds.unwrap_or(0)))
                .map(Duration::from_secs)
                .ok_or_else(|| format!("duration `{v}` is too large")),
        )
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a duration")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_u64(v.try_into().map_err(E::custom)?)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                use serde::de::Unexpected;

                match Duration::parse(v) {
                    Some(Ok(duration)) => Ok(duration),
                    Some(Err(e)) => Err(E::custom(e)),
                    None => Err(E::invalid_value(Unexpected::Str(v), &"a duration")),
                }
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        duration.0
    }
}

impl From<Duration> for time::Duration {
    fn from(duration: Duration) -> Self {
        time::Duration::new(
            duration.0.as_secs().min(i64::MAX as u64) as i64,
            duration.0.subsec_nanos() as i32,
        )
    }
}

/// A `category = [feeds...]` table that remembers the order the categories were written in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Categories(pub Vec<(String, Vec<String>)>);

impl<'de> Deserialize<'de> for Categories {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CategoriesVisitor;

        impl<'de> Visitor<'de> for CategoriesVisitor {
            type Value = Categories;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a table mapping category names to lists of feeds")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut result = Vec::with_capacity(map.size_hint().unwrap_or(0));

                while let Some((name, feeds)) = map.next_entry::<String, Vec<String>>()? {
                    result.push((name, feeds));
                }

                Ok(Categories(result))
            }
        }

        deserializer.deserialize_map(CategoriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        duration: Duration,
    }

    #[derive(Deserialize)]
    struct CategoriesWrapper {
        categories: Categories,
    }

    #[test]
    fn durations_parse_from_strings_and_integers() {
        let parse = |s: &str| toml::from_str::<Wrapper>(s).map(|w| w.duration);

        assert_eq!(parse("duration = 90").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse(r#"duration = "1d 2h 3m 4s""#).unwrap(),
            Duration::from_secs(93_784),
        );
        assert_eq!(parse(r#"duration = "72h""#).unwrap(), Duration::from_secs(259_200));
        assert!(parse(r#"duration = "soon""#).is_err());
        assert!(parse(r#"duration = """#).is_err());
    }

    #[test]
    fn categories_keep_document_order() {
        let cfg: CategoriesWrapper = toml::from_str(
            r#"
            [categories]
            zebra = ["z1"]
            alpha = ["a1", "a2"]
            middle = []
            "#,
        )
        .unwrap();

        let names = cfg
            .categories
            .0
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["zebra", "alpha", "middle"]);
        assert_eq!(cfg.categories.0[1].1, ["a1", "a2"]);
    }
}
