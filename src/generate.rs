//! Regeneration of the global nginx configuration
//!
//! template + options file → substitution table → rendered text → backup
//! protected write of `nginx.conf`.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::template::{self, RenderedConfig, SubstitutionTable};
use crate::writer::ConfigWriter;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    template_path: PathBuf,
    options_path: PathBuf,
    output_path: PathBuf,
    instance_home: PathBuf,
    config_root: PathBuf,
    fragment_dir: PathBuf,
    writer: ConfigWriter,
}

impl ConfigGenerator {
    pub fn from_settings(settings: &Settings) -> Self {
        let paths = &settings.paths;
        Self {
            template_path: paths.template(),
            options_path: paths.options_file(),
            output_path: paths.output(),
            instance_home: paths.instance_home.clone(),
            config_root: paths.config_root(),
            fragment_dir: paths.fragment_dir(),
            writer: ConfigWriter::new(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn load_template(&self) -> Result<String> {
        std::fs::read_to_string(&self.template_path).map_err(|source| Error::TemplateMissing {
            path: self.template_path.clone(),
            source,
        })
    }

    pub fn substitution_table(&self) -> Result<SubstitutionTable> {
        let options = Options::load(&self.options_path);
        SubstitutionTable::from_options(
            &options,
            &self.instance_home,
            &self.config_root,
            &self.fragment_dir,
        )
    }

    /// Render without writing anything
    pub fn render(&self) -> Result<RenderedConfig> {
        let template = self.load_template()?;
        let table = self.substitution_table()?;
        template::render(&template, &table)
    }

    /// Render and write `nginx.conf`, keeping the previous file as `.prev`
    pub fn generate(&self) -> Result<RenderedConfig> {
        info!(template = %self.template_path.display(), "Generating new config");
        let rendered = self.render()?;
        self.writer
            .write_config(&self.output_path, &rendered.to_string())?;
        Ok(rendered)
    }
}
