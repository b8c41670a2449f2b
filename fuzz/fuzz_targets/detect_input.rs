#![no_main]

use std::io::Read;

use libfuzzer_sys::fuzz_target;
use unseal_core::{InputSource, OpenedSource};
use unseal_pgp::Keyring;

fuzz_target!(|data: &[u8]| {
    let keyring = Keyring::from_certs(Vec::new());
    let Ok(mut source) = OpenedSource::open(InputSource::Bytes(data.to_vec())) else {
        return;
    };
    // Detection must neither panic nor lose bytes the executor would need.
    let _ = unseal_pgp::detect(&keyring, &mut source);
    let mut replayed = Vec::new();
    source
        .into_reader()
        .read_to_end(&mut replayed)
        .expect("replay");
    assert_eq!(replayed, data);
});
