#![no_main]
use libfuzzer_sys::fuzz_target;
use logsig_core::records::SigRecord;
use logsig_core::tlv::decode_tlv;

fuzz_target!(|data: &[u8]| {
    if let Ok((tlv, used)) = decode_tlv(data) {
        assert!(used <= data.len());
        if let Ok(rec) = SigRecord::from_tlv(&tlv) {
            // Anything we accept must re-encode.
            let _ = rec.to_tlv().and_then(|t| t.to_bytes());
        }
    }
});
