#![no_main]
use libfuzzer_sys::fuzz_target;
use logsig_core::TlvReader;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut rdr = TlvReader::new(Cursor::new(data));
    if rdr.check_magic(logsig_core::tlv::LOGSIG_MAGIC).is_err() {
        return;
    }
    while let Ok(Some(_)) = rdr.block_params(false) {}
});
