use std::fs::File;

use log::info;

use advsign::stager::{TrustAnchor, UpdateVerifier};

/// Verify every image of `update.zip` against the local trust anchor
fn main() {
    let anchor = TrustAnchor::local();

    assert!(anchor.is_valid(), "no valid bootloader on flash");

    let verifier = UpdateVerifier::new(anchor.load_key_area().unwrap());

    let mut archive = zip::ZipArchive::new(File::open("/cache/update.zip").unwrap()).unwrap();

    verifier.verify_package(&mut archive).unwrap();

    info!("Update package verified");
}
