//! A command-line interface to the `advsign` crate.

use std::fs::File;
use std::io::Write as _;
use std::path::{self, Path, PathBuf};

use anyhow::{bail, Context};

use clap::{ColorChoice, Parser, Subcommand, ValueEnum};

use embassy_futures::block_on;

use advsign::stager::{StdIo, TrustAnchor, UpdateVerifier, FASTBOOT_PARTITION};
use advsign::{CaImageHeader, CompositeImage, KeyArea, SignTrailer};

use log::{info, LevelFilter};

/// Verify ADVCA-signed firmware images from OTA update packages
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, arg_required_else_help = true, color = ColorChoice::Auto)]
struct Cli {
    /// Verbosity
    #[arg(short = 'l', long, default_value = "regular")]
    verbosity: Verbosity,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Command
#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the bootloader partition carries a valid trust anchor
    Anchor {
        /// Bootloader partition (or a dump of one) to read the flag from
        #[arg(short, long, default_value = FASTBOOT_PARTITION)]
        partition: PathBuf,
    },
    /// Verify every recognized image of an update package
    Package {
        /// Key area file (a 1024-byte dump); when not given, the key area is
        /// read from the bootloader partition
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Bootloader partition the key area is read from when no key file
        /// is given
        #[arg(short, long, default_value = FASTBOOT_PARTITION)]
        partition: PathBuf,

        /// The update package (zip) to verify
        package: PathBuf,
    },
    /// Verify a single, already staged image file
    Image {
        /// Key area file (a 1024-byte dump)
        #[arg(short, long)]
        key: PathBuf,

        /// Image layout
        #[arg(short = 't', long, default_value = "header")]
        layout: ImageLayout,

        /// The image file to verify
        image: PathBuf,
    },
    /// Print the parsed header of a self-describing image
    Info {
        /// The image file to inspect
        image: PathBuf,
    },
}

/// Verbosity
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Verbosity {
    Silent,
    #[default]
    Regular,
    Verbose,
}

impl Verbosity {
    fn log_level(&self) -> LevelFilter {
        match self {
            Self::Silent => LevelFilter::Off,
            Self::Regular => LevelFilter::Info,
            Self::Verbose => LevelFilter::Debug,
        }
    }
}

/// Image layout
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ImageLayout {
    /// Composite bootloader image (fastboot)
    Composite,
    /// Self-describing image (kernel, recovery, trusted core)
    #[default]
    Header,
    /// Trailer-signed image (boot arguments)
    Trailer,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter_level(args.verbosity.log_level())
        .init();

    if let Some(command) = args.command {
        let result = match command {
            Command::Anchor { partition } => anchor(partition),
            Command::Package {
                key,
                partition,
                package,
            } => verify_package(key, partition, package),
            Command::Image { key, layout, image } => verify_image(key, layout, image),
            Command::Info { image } => info(image),
        };

        if let Err(err) = result {
            log::error!("{:#}", err);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn anchor(partition: PathBuf) -> anyhow::Result<()> {
    let anchor = TrustAnchor::new(&partition);

    if !anchor.is_valid() {
        bail!(
            "No valid trust anchor on `{}`",
            anchor.partition().display()
        );
    }

    info!("Valid trust anchor on `{}`", anchor.partition().display());

    Ok(())
}

fn verify_package(
    key: Option<PathBuf>,
    partition: PathBuf,
    package: PathBuf,
) -> anyhow::Result<()> {
    let key_area = if let Some(key) = key {
        load_key_area(&key)?
    } else {
        let anchor = TrustAnchor::new(&partition);

        if !anchor.is_valid() {
            bail!(
                "No valid trust anchor on `{}`; refusing to verify",
                anchor.partition().display()
            );
        }

        anchor.load_key_area().with_context(|| {
            format!(
                "Loading key area from `{}` failed",
                anchor.partition().display()
            )
        })?
    };

    let package = path::absolute(&package)
        .with_context(|| format!("Parsing package path `{}` failed", package.display()))?;

    info!("Verifying update package `{}`...", package.display());

    let mut archive =
        zip::ZipArchive::new(File::open(&package).context("Loading update package failed")?)
            .context("Reading update package failed")?;

    let verifier = UpdateVerifier::new(key_area);

    if let Err((kind, rejection)) = verifier.verify_package(&mut archive) {
        bail!("`{}` rejected: {}", kind.entry_name(), rejection);
    }

    info!("Update package verified successfully");

    Ok(())
}

fn verify_image(key: PathBuf, layout: ImageLayout, image: PathBuf) -> anyhow::Result<()> {
    let key_area = load_key_area(&key)?;

    let image = path::absolute(&image)
        .with_context(|| format!("Parsing image path `{}` failed", image.display()))?;

    info!("Verifying image `{}`...", image.display());

    let mut buf = vec![0; 65536];
    let mut io = StdIo(File::open(&image).context("Loading image failed")?);

    let result = match layout {
        ImageLayout::Composite => {
            block_on(CompositeImage::load_and_verify(&mut io, &mut buf, &key_area)).map(|_| ())
        }
        ImageLayout::Header => {
            block_on(CaImageHeader::load_and_verify(&mut io, &mut buf, &key_area)).map(|_| ())
        }
        ImageLayout::Trailer => {
            block_on(SignTrailer::load_and_verify(&mut io, &mut buf, &key_area)).map(|_| ())
        }
    };

    if let Err(e) = result {
        bail!("`{}` rejected: {}", image.display(), e);
    }

    info!("Image verified successfully");

    Ok(())
}

fn info(image: PathBuf) -> anyhow::Result<()> {
    let image = path::absolute(&image)
        .with_context(|| format!("Parsing image path `{}` failed", image.display()))?;

    let mut io = StdIo(File::open(&image).context("Loading image failed")?);

    let header = match block_on(CaImageHeader::load(&mut io)) {
        Ok(header) => header,
        Err(e) => bail!("`{}`: {}", image.display(), e),
    };

    println!(
        "header version:   {}",
        String::from_utf8_lossy(header.header_version())
    );
    println!("total len:        {}", header.total_len());
    println!("code offset:      {:#x}", header.code_offset());
    println!("signed image len: {}", header.signed_image_len());
    println!("signature offset: {:#x}", header.signature_offset());
    println!("signature len:    {}", header.signature_len());
    println!("block num:        {}", header.block_num());
    println!("software version: {:#x}", header.software_version());
    println!("crc32:            {:#010x}", header.crc32());

    Ok(())
}

fn load_key_area(path: &Path) -> anyhow::Result<KeyArea> {
    let path = path::absolute(path)
        .with_context(|| format!("Parsing key path `{}` failed", path.display()))?;

    let key_area = block_on(KeyArea::load(StdIo(
        File::open(&path).context("Loading key area failed")?,
    )))
    .map_err(|e| anyhow::anyhow!("Reading key area from `{}` failed: {}", path.display(), e))?;

    Ok(key_area)
}
