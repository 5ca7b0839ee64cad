use crate::config::Configuration;
use anyhow::Error;
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

#[derive(Debug, Clone)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn load_toml<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let document = std::fs::read_to_string(file)?;
        Self::parse(&document)
    }

    fn parse(document: &str) -> Result<Self, Error> {
        let document = DocumentMut::from_str(document)?;
        Ok(Self { document })
    }

    fn into_configuration(self) -> Result<Configuration, Error> {
        Ok(toml_edit::de::from_document(self.document)?)
    }

    pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        Self::load_toml(file)?.into_configuration()
    }

    pub fn to_toml(config: &Configuration) -> Result<String, Error> {
        Ok(toml_edit::ser::to_string_pretty(config)?)
    }
}

impl FromStr for TomlConfiguration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
