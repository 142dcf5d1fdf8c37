//! CLI command definitions and handlers.

use std::io::{self, Write};
use std::path::PathBuf;

use carapace_image::{Image, ImageType, Section, Usage, partition_reader, section_reader};
use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;

use crate::config::AssemblyConfig;
use crate::mount::MountPlan;

/// Carapace - container root filesystem assembly
#[derive(Parser)]
#[command(name = "carapace")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "CARAPACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Detect an image and print its partitions and sections as JSON
    Inspect {
        /// Image file or sandbox directory
        image: PathBuf,

        /// Open the image for writing
        #[arg(short, long)]
        writable: bool,
    },

    /// Copy a partition or section of an image to stdout
    #[command(group(ArgGroup::new("selector").required(true).multiple(true).args(["partition", "section", "index"])))]
    Read {
        /// Image file
        image: PathBuf,

        /// Partition name
        #[arg(long, conflicts_with = "section")]
        partition: Option<String>,

        /// Section name
        #[arg(long)]
        section: Option<String>,

        /// Index in the partition list, or in the section list with --section
        #[arg(long)]
        index: Option<usize>,

        /// Look the index up in the section list
        #[arg(long)]
        sections: bool,
    },

    /// Validate a mount list and print the ordered plan
    Plan {
        /// JSON mount plan
        mounts: PathBuf,
    },
}

/// JSON view of a detected image.
#[derive(Debug, Serialize)]
pub struct ImageReport<'a> {
    path: &'a std::path::Path,
    name: &'a str,
    #[serde(rename = "type")]
    image_type: ImageType,
    writable: bool,
    read_only_filesystem: bool,
    usage: Usage,
    partitions: &'a [Section],
    sections: &'a [Section],
}

impl<'a> ImageReport<'a> {
    /// Describe `image`.
    #[must_use]
    pub fn new(image: &'a Image) -> Self {
        Self {
            path: &image.path,
            name: &image.name,
            image_type: image.image_type,
            writable: image.writable,
            read_only_filesystem: image.check_writable().is_err(),
            usage: image.usage,
            partitions: &image.partitions,
            sections: &image.sections,
        }
    }
}

impl Cli {
    fn load_config(&self) -> Result<AssemblyConfig> {
        match &self.config {
            Some(path) => AssemblyConfig::load(path)
                .wrap_err_with(|| format!("Failed to load config {}", path.display())),
            None => {
                let path = AssemblyConfig::default_path();
                if path.exists() {
                    AssemblyConfig::load(&path).wrap_err("Failed to load default config")
                } else {
                    Ok(AssemblyConfig::default())
                }
            }
        }
    }

    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let config = self.load_config()?;

        match self.command {
            Commands::Inspect { image, writable } => {
                let image = config
                    .detector()
                    .init(&image, writable)
                    .wrap_err_with(|| format!("Failed to open {}", image.display()))?;
                println!("{}", serde_json::to_string_pretty(&ImageReport::new(&image))?);
                Ok(())
            }

            Commands::Read {
                image,
                partition,
                section,
                index,
                sections,
            } => {
                let image = config
                    .detector()
                    .init(&image, false)
                    .wrap_err_with(|| format!("Failed to open {}", image.display()))?;

                let mut reader = if section.is_some() || sections {
                    section_reader(&image, section.as_deref(), index)
                } else {
                    partition_reader(&image, partition.as_deref(), index)
                }
                .wrap_err("Failed to select image range")?;

                let mut stdout = io::stdout().lock();
                io::copy(&mut reader, &mut stdout)?;
                stdout.flush()?;
                Ok(())
            }

            Commands::Plan { mounts } => {
                let json = std::fs::read_to_string(&mounts)
                    .wrap_err_with(|| format!("Failed to read {}", mounts.display()))?;
                let plan = MountPlan::from_json(&json)?;

                let mut points = config.points();
                points
                    .import_plan(&plan)
                    .wrap_err("Mount list rejected")?;
                tracing::info!(mounts = points.len(), "Mount plan validated");
                println!("{}", points.plan().to_json()?);
                Ok(())
            }
        }
    }
}
