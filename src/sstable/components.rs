//! Sstable component naming. Every generation is a family of files sharing
//! the `<ks>-<cf>-<version>-<generation>-<component>.db` pattern; the TOC
//! component is the authoritative list of what belongs to the family.

use crate::consts::SSTABLE_FILE_SUFFIX;
use crate::err::Error;
use crate::types::Generation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    Toc,
    Data,
    Index,
    Summary,
    Filter,
    Statistics,
    CompressionInfo,
    TemporaryToc,
    TemporaryStatistics,
}

impl Component {
    /// Components a finished sstable must carry, as written into the TOC.
    pub const LIVE: [Component; 7] = [
        Component::Toc,
        Component::Data,
        Component::Index,
        Component::Summary,
        Component::Filter,
        Component::Statistics,
        Component::CompressionInfo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Component::Toc => "TOC",
            Component::Data => "Data",
            Component::Index => "Index",
            Component::Summary => "Summary",
            Component::Filter => "Filter",
            Component::Statistics => "Statistics",
            Component::CompressionInfo => "CompressionInfo",
            Component::TemporaryToc => "TemporaryTOC",
            Component::TemporaryStatistics => "TemporaryStatistics",
        }
    }

    pub fn parse(name: &str) -> Option<Component> {
        match name {
            "TOC" => Some(Component::Toc),
            "Data" => Some(Component::Data),
            "Index" => Some(Component::Index),
            "Summary" => Some(Component::Summary),
            "Filter" => Some(Component::Filter),
            "Statistics" => Some(Component::Statistics),
            "CompressionInfo" => Some(Component::CompressionInfo),
            "TemporaryTOC" => Some(Component::TemporaryToc),
            "TemporaryStatistics" => Some(Component::TemporaryStatistics),
            _ => None,
        }
    }
}

/// Fully parsed sstable file name.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    pub keyspace: String,
    pub cf_name: String,
    pub version: String,
    pub generation: Generation,
    pub component: Component,
}

impl Descriptor {
    pub fn new(
        keyspace: impl Into<String>,
        cf_name: impl Into<String>,
        version: impl Into<String>,
        generation: Generation,
        component: Component,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            cf_name: cf_name.into(),
            version: version.into(),
            generation,
            component,
        }
    }

    pub fn filename(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}{}",
            self.keyspace,
            self.cf_name,
            self.version,
            self.generation,
            self.component.name(),
            SSTABLE_FILE_SUFFIX,
        )
    }

    /// Parses `<ks>-<cf>-<version>-<generation>-<component>.db`. Keyspace
    /// and column family names never contain dashes.
    pub fn parse(name: &str) -> Result<Descriptor, Error> {
        let invalid = || Error::InvalidSstableFilename {
            name: name.to_string(),
        };
        let stem = name.strip_suffix(SSTABLE_FILE_SUFFIX).ok_or_else(invalid)?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() != 5 {
            return Err(invalid());
        }
        let generation: Generation = parts[3].parse().map_err(|_| invalid())?;
        let component = Component::parse(parts[4]).ok_or_else(invalid)?;
        Ok(Descriptor {
            keyspace: parts[0].to_string(),
            cf_name: parts[1].to_string(),
            version: parts[2].to_string(),
            generation,
            component,
        })
    }

    pub fn with_component(&self, component: Component) -> Descriptor {
        Descriptor {
            component,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_roundtrip() {
        let descriptor = Descriptor::new("apps", "events", "la", 42, Component::Data);
        let name = descriptor.filename();
        assert_eq!(name, "apps-events-la-42-Data.db");
        assert_eq!(Descriptor::parse(&name).unwrap(), descriptor);
    }

    #[test]
    fn every_component_name_parses_back() {
        for component in [
            Component::Toc,
            Component::Data,
            Component::Index,
            Component::Summary,
            Component::Filter,
            Component::Statistics,
            Component::CompressionInfo,
            Component::TemporaryToc,
            Component::TemporaryStatistics,
        ] {
            assert_eq!(Component::parse(component.name()), Some(component));
        }
    }

    #[test]
    fn malformed_names_are_rejected()  {
        for name in [
            "events-la-1-Data.db",
            "apps-events-la-x-Data.db",
            "apps-events-la-1-Nope.db",
            "apps-events-la-1-Data.txt",
            "apps-events-la-1-2-Data.db",
        ] {
            assert!(Descriptor::parse(name).is_err(), "{name} should not parse");
        }
    }
}
