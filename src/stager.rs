//! Staging and verification of images pulled out of an update package
//!
//! The update package is a plain zip archive; each recognized entry is
//! extracted to an anonymous scratch file, verified with the layout matching
//! its name and the scratch file is released again on every exit path. An
//! entry that is simply not part of the package is a success — update
//! packages need not carry every image — while a single rejected image must
//! abort the whole update.
//!
//! The trusted key area is owned by an explicit [`UpdateVerifier`] session
//! object, so concurrent sessions (and tests) cannot interfere through
//! shared state.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use embassy_futures::block_on;

use embedded_io_async::{ErrorType, Read, Seek, SeekFrom};

use log::{info, warn};

use zip::result::ZipError;
use zip::ZipArchive;

use crate::{
    check_valid_flag, CaImageHeader, CompositeImage, KeyArea, SignTrailer, VerifyError,
};

/// The block device holding the currently installed bootloader, whose key
/// area and validity flag anchor all verification
pub const FASTBOOT_PARTITION: &str =
    "/dev/block/platform/soc/f9830000.himciv200.MMC/by-name/fastboot";

/// A wrapper for types implementing `std::io::Read` and `std::io::Seek` to
/// implement the `embedded-io-async` `Read` and `Seek` traits
pub struct StdIo<T>(pub T);

impl<T> ErrorType for StdIo<T> {
    type Error = io::Error;
}

impl<T> Read for StdIo<T>
where
    T: io::Read,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf)
    }
}

impl<T> Seek for StdIo<T>
where
    T: io::Seek,
{
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        let pos = match pos {
            SeekFrom::Start(n) => io::SeekFrom::Start(n),
            SeekFrom::End(n) => io::SeekFrom::End(n),
            SeekFrom::Current(n) => io::SeekFrom::Current(n),
        };

        self.0.seek(pos)
    }
}

/// The trust anchor on flash: the bootloader partition carrying the validity
/// flag and the key area
pub struct TrustAnchor {
    partition: PathBuf,
}

impl TrustAnchor {
    /// Create a trust anchor reader over the given bootloader partition
    /// (or a dump of one)
    pub fn new(partition: impl Into<PathBuf>) -> Self {
        Self {
            partition: partition.into(),
        }
    }

    /// Create a trust anchor reader over the device's local bootloader
    /// partition
    pub fn local() -> Self {
        Self::new(FASTBOOT_PARTITION)
    }

    /// The partition path this anchor reads from
    pub fn partition(&self) -> &Path {
        &self.partition
    }

    /// Whether a valid, signed bootloader is installed
    ///
    /// An unreadable partition means "no enforceable trust anchor" and is
    /// reported as `false`, not as an error.
    pub fn is_valid(&self) -> bool {
        let file = match File::open(&self.partition) {
            Ok(file) => file,
            Err(e) => {
                warn!("Can't open {}: {}", self.partition.display(), e);
                return false;
            }
        };

        match block_on(check_valid_flag(StdIo(file))) {
            Ok(valid) => {
                if valid {
                    info!("Find valid fastboot on flash");
                } else {
                    info!("No valid fastboot on flash");
                }

                valid
            }
            Err(e) => {
                warn!("Can't read {}: {}", self.partition.display(), e);
                false
            }
        }
    }

    /// Load the key area from the partition
    ///
    /// Failing to read the key area is fatal for the whole update session;
    /// without it no image can be legitimately accepted.
    pub fn load_key_area(&self) -> io::Result<KeyArea> {
        let file = File::open(&self.partition)?;

        block_on(KeyArea::load(StdIo(file))).map_err(|e| match e {
            VerifyError::Io(e) => e,
            VerifyError::Eof => io::ErrorKind::UnexpectedEof.into(),
            e => io::Error::other(std::format!("{}", e)),
        })
    }
}

/// The images an update package may carry, together with the entry name and
/// image layout each one uses
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ImageKind {
    /// The composite bootloader image
    Fastboot,
    /// The kernel image (self-describing)
    Kernel,
    /// The recovery image (self-describing)
    Recovery,
    /// The trusted-core firmware image (self-describing)
    TrustedCore,
    /// The boot-arguments image (trailer-signed)
    BootArgs,
}

impl ImageKind {
    /// Every recognized image, in the order they are verified
    pub const ALL: [Self; 5] = [
        Self::Fastboot,
        Self::Kernel,
        Self::Recovery,
        Self::TrustedCore,
        Self::BootArgs,
    ];

    /// The archive entry name this image is stored under
    pub fn entry_name(&self) -> &'static str {
        match self {
            Self::Fastboot => "fastboot.img",
            Self::Kernel => "boot.img",
            Self::Recovery => "recovery.img",
            Self::TrustedCore => "trustedcore.img",
            Self::BootArgs => "bootargs.img",
        }
    }

    /// Look up the image kind for an archive entry name
    pub fn from_entry_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.entry_name() == name)
    }
}

/// Why an image was rejected
#[derive(Debug)]
pub enum Rejection {
    /// The entry name is not one of the recognized images
    UnsupportedImage,
    /// The entry could not be staged to a scratch file
    Extract(io::Error),
    /// The staged image failed verification
    Verify(VerifyError<io::Error>),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::UnsupportedImage => write!(f, "Unsupported image"),
            Self::Extract(e) => write!(f, "Can't stage image: {}", e),
            Self::Verify(e) => write!(f, "{}", e),
        }
    }
}

/// The terminal result of verifying one image of an update package
#[derive(Debug)]
pub enum Outcome {
    /// The image is not part of the package; nothing to verify
    Absent,
    /// The image is present and correctly signed
    Verified,
    /// The image is present but must not be flashed
    Rejected(Rejection),
}

impl Outcome {
    /// Whether this outcome permits the update to proceed
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// One update-verification session, owning the trusted key area
pub struct UpdateVerifier {
    key: KeyArea,
}

impl UpdateVerifier {
    /// Size of the scratch buffer hashed regions are streamed through
    const BUF_LEN: usize = 65536;

    /// Create a verification session around the trusted key area
    pub fn new(key: KeyArea) -> Self {
        Self { key }
    }

    /// The session's trusted key area
    pub fn key_area(&self) -> &KeyArea {
        &self.key
    }

    /// Verify the archive entry with the given name
    ///
    /// Unrecognized names are rejected without extracting anything.
    ///
    /// # Arguments
    /// * `archive` - The opened update package
    /// * `name` - The entry name, e.g. `boot.img`
    pub fn verify_named_image<R>(&self, archive: &mut ZipArchive<R>, name: &str) -> Outcome
    where
        R: io::Read + io::Seek,
    {
        let Some(kind) = ImageKind::from_entry_name(name) else {
            warn!("`{}` is not a recognized image", name);
            return Outcome::Rejected(Rejection::UnsupportedImage);
        };

        self.verify_image(archive, kind)
    }

    /// Verify one recognized image of the update package
    ///
    /// # Arguments
    /// * `archive` - The opened update package
    /// * `kind` - The image to verify
    pub fn verify_image<R>(&self, archive: &mut ZipArchive<R>, kind: ImageKind) -> Outcome
    where
        R: io::Read + io::Seek,
    {
        let name = kind.entry_name();

        if archive.index_for_name(name).is_none() {
            info!("Can't find {} in update package, need not verify", name);
            return Outcome::Absent;
        }

        info!("Verify {} start", name);

        // The scratch file is anonymous; the OS reclaims it when the handle
        // drops, whichever way this function returns
        let scratch = match self.stage_entry(archive, name) {
            Ok(scratch) => scratch,
            Err(e) => {
                warn!("Can't stage {}: {}", name, e);
                return Outcome::Rejected(Rejection::Extract(e));
            }
        };

        let mut buf = std::vec![0; Self::BUF_LEN];
        let mut io = StdIo(scratch);

        let result = match kind {
            ImageKind::Fastboot => {
                block_on(CompositeImage::load_and_verify(&mut io, &mut buf, &self.key)).map(|_| ())
            }
            ImageKind::Kernel | ImageKind::Recovery | ImageKind::TrustedCore => {
                block_on(CaImageHeader::load_and_verify(&mut io, &mut buf, &self.key)).map(|_| ())
            }
            ImageKind::BootArgs => {
                block_on(SignTrailer::load_and_verify(&mut io, &mut buf, &self.key)).map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                info!("Verify {} OK", name);
                Outcome::Verified
            }
            Err(e) => {
                warn!("Verify {} failed: {}", name, e);
                Outcome::Rejected(Rejection::Verify(e))
            }
        }
    }

    /// Verify every recognized image of the update package, aborting on the
    /// first rejection
    ///
    /// Absent images are skipped; an update package need not carry every
    /// image. A rejected image is permanent for this package - there are no
    /// retries, the operator must supply a corrected package.
    ///
    /// # Arguments
    /// * `archive` - The opened update package
    pub fn verify_package<R>(
        &self,
        archive: &mut ZipArchive<R>,
    ) -> Result<(), (ImageKind, Rejection)>
    where
        R: io::Read + io::Seek,
    {
        for kind in ImageKind::ALL {
            match self.verify_image(archive, kind) {
                Outcome::Absent | Outcome::Verified => (),
                Outcome::Rejected(rejection) => return Err((kind, rejection)),
            }
        }

        Ok(())
    }

    /// Extract the named entry to an anonymous scratch file
    fn stage_entry<R>(&self, archive: &mut ZipArchive<R>, name: &str) -> io::Result<File>
    where
        R: io::Read + io::Seek,
    {
        let mut entry = archive.by_name(name).map_err(|e| match e {
            ZipError::Io(e) => e,
            e => io::Error::other(e),
        })?;

        let mut scratch = tempfile::tempfile()?;

        io::copy(&mut entry, &mut scratch)?;

        Ok(scratch)
    }
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Seek as _, SeekFrom, Write as _};
    use std::vec::Vec;

    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipArchive, ZipWriter};

    use crate::testutil::*;
    use crate::{Stage, VerifyError, UBOOT_FLAG_OFFSET, UBOOT_VALID_FLAG};

    use super::{ImageKind, Outcome, Rejection, TrustAnchor, UpdateVerifier};

    fn package(entries: &[(&str, &[u8])]) -> ZipArchive<Cursor<Vec<u8>>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }

        ZipArchive::new(writer.finish().unwrap()).unwrap()
    }

    /// A package carrying every recognized image, all correctly signed,
    /// passes as a whole
    #[test]
    fn package_round_trip() {
        let key = test_key();
        let area = forge_key_area(&key, AUX_TOTAL_LEN as u32);

        let fastboot = forge_composite(&key, &area);
        let kernel = forge_header_image(&key, 5000);
        let recovery = forge_header_image(&key, 3000);
        let trustedcore = forge_header_image(&key, 2000);
        let bootargs = forge_trailer_image(&key, 1000);

        let mut archive = package(&[
            ("fastboot.img", &fastboot),
            ("boot.img", &kernel),
            ("recovery.img", &recovery),
            ("trustedcore.img", &trustedcore),
            ("bootargs.img", &bootargs),
        ]);

        let verifier = UpdateVerifier::new(area);

        verifier.verify_package(&mut archive).unwrap();

        assert!(matches!(
            verifier.verify_image(&mut archive, ImageKind::Kernel),
            Outcome::Verified
        ));
    }

    /// An image that is not part of the package is a success, not a failure
    #[test]
    fn absent_is_success() {
        let key = test_key();
        let area = forge_key_area(&key, AUX_TOTAL_LEN as u32);

        let kernel = forge_header_image(&key, 5000);

        let mut archive = package(&[("boot.img", &kernel)]);

        let verifier = UpdateVerifier::new(area);

        assert!(matches!(
            verifier.verify_image(&mut archive, ImageKind::TrustedCore),
            Outcome::Absent
        ));

        verifier.verify_package(&mut archive).unwrap();
    }

    /// A single corrupted image aborts the whole package at that image
    #[test]
    fn rejection_aborts_package() {
        let key = test_key();
        let area = forge_key_area(&key, AUX_TOTAL_LEN as u32);

        let kernel = forge_header_image(&key, 5000);

        let mut recovery = forge_header_image(&key, 3000);
        recovery[300] ^= 1;

        let mut archive = package(&[("boot.img", &kernel), ("recovery.img", &recovery)]);

        let verifier = UpdateVerifier::new(area);

        let (kind, rejection) = verifier.verify_package(&mut archive).unwrap_err();

        assert_eq!(kind, ImageKind::Recovery);
        assert!(matches!(
            rejection,
            Rejection::Verify(VerifyError::SignatureInvalid(Stage::Image))
        ));
    }

    /// Unrecognized entry names are rejected without extraction
    #[test]
    fn unsupported_name() {
        let key = test_key();
        let area = forge_key_area(&key, AUX_TOTAL_LEN as u32);

        let mut archive = package(&[("system.img", b"whatever".as_slice())]);

        let verifier = UpdateVerifier::new(area);

        assert!(matches!(
            verifier.verify_named_image(&mut archive, "system.img"),
            Outcome::Rejected(Rejection::UnsupportedImage)
        ));

        // Recognized names still dispatch by name
        assert!(matches!(
            verifier.verify_named_image(&mut archive, "bootargs.img"),
            Outcome::Absent
        ));
    }

    /// The trust anchor flag is only valid with the marker bytes in place
    #[test]
    fn trust_anchor_flag() {
        let mut partition = tempfile::NamedTempFile::new().unwrap();

        let mut content = std::vec![0u8; 0x3000];
        content[UBOOT_FLAG_OFFSET as usize..UBOOT_FLAG_OFFSET as usize + 4]
            .copy_from_slice(&UBOOT_VALID_FLAG);

        partition.write_all(&content).unwrap();
        partition.flush().unwrap();

        let anchor = TrustAnchor::new(partition.path());

        assert!(anchor.is_valid());

        partition.seek(SeekFrom::Start(UBOOT_FLAG_OFFSET)).unwrap();
        partition.write_all(&[0xff; 4]).unwrap();
        partition.flush().unwrap();

        assert!(!anchor.is_valid());

        // Unreadable partition: no enforceable trust anchor, not a crash
        assert!(!TrustAnchor::new("/nonexistent/fastboot").is_valid());
    }

    /// The key area read from a partition dump round-trips
    #[test]
    fn trust_anchor_key_area() {
        let key = test_key();
        let area = forge_key_area(&key, AUX_TOTAL_LEN as u32);

        let mut partition = tempfile::NamedTempFile::new().unwrap();

        let mut content = area.as_bytes().to_vec();
        content.resize(0x4000, 0);

        partition.write_all(&content).unwrap();
        partition.flush().unwrap();

        let anchor = TrustAnchor::new(partition.path());

        let loaded = anchor.load_key_area().unwrap();

        assert_eq!(loaded.as_bytes(), area.as_bytes());

        assert!(TrustAnchor::new("/nonexistent/fastboot")
            .load_key_area()
            .is_err());
    }
}
