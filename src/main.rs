//! Entry point for the rsym symbol embedder.
//!
//! Simple flow: parse args → map input → decode debug info → merge →
//! rewrite the PE with a `.rossym` section appended.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rsym::config::Config;
use rsym::dbghelp::{self, NullEngine};
use rsym::pe::PeImage;
use rsym::strings::StringPool;
use rsym::{coff, relocs, rossym, stabs, symbols, writer};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

fn main() -> Result<()> {
    // Usage errors exit with status 1, like every other failure.
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Processing input: {}", config.input.display());
    let file = File::open(&config.input)
        .with_context(|| format!("failed to open {}", config.input.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };

    // ELF images pass through untouched.
    if mmap.starts_with(ELF_MAGIC) {
        info!("{} is an ELF image, nothing to do", config.input.display());
        return Ok(());
    }

    let image = PeImage::parse(&mmap)?;
    let mut pool = StringPool::new();

    let primary = match image.stab_sections()? {
        Some(stab) => stabs::convert_stabs(
            stab.stab,
            stab.stabstr,
            image.optional().image_base() as u32,
            &mut pool,
        )?,
        None => {
            // Assembly-only modules carry no stabs; fall back to the line
            // enumerator. Without a native engine the COFF table below is
            // the only source of names.
            warn!(
                "{} has no stabs, line information comes from the symbol engine",
                config.input.display()
            );
            let sources = config.sources.clone().unwrap_or_default();
            dbghelp::collect_symbols(&mut NullEngine, &sources, &mut pool)?
        }
    };

    // The COFF symbol table names the functions stabs never saw.
    let coff_symbols = coff::convert_symbols(&image, &mut pool)?;
    let merged = symbols::merge(&primary, &coff_symbols);

    let payload = if merged.is_empty() {
        None
    } else {
        Some(rossym::build_payload(&merged, &pool))
    };

    let relocations = relocs::rewrite(&image)?;
    writer::write_image(&config.output, &image, relocations, payload.as_deref())?;

    info!(
        "Wrote {} ({} symbols)",
        config.output.display(),
        merged.len()
    );
    Ok(())
}
