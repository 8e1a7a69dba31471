//! Report archive handling
//!
//! A report is a ZIP with two UTF-8 entries: `debuginfo.txt` and
//! `exception.txt`. Other entries are ignored.

use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::types::{ExtractedReport, ProtocolError, DEBUG_INFO_ENTRY, STACK_TRACE_ENTRY};

/// Read both required entries from a decrypted archive
pub fn extract_report(archive_bytes: &[u8]) -> Result<ExtractedReport, ProtocolError> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| ProtocolError::Archive(format!("Failed to open report archive: {}", e)))?;

    let debug_info = read_entry(&mut archive, DEBUG_INFO_ENTRY)?;
    let stack_trace = read_entry(&mut archive, STACK_TRACE_ENTRY)?;

    Ok(ExtractedReport {
        debug_info,
        stack_trace,
    })
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String, ProtocolError> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| ProtocolError::Archive(format!("Missing '{}': {}", name, e)))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| ProtocolError::Archive(format!("Failed to read '{}': {}", name, e)))?;
    Ok(content)
}

/// Package a report the way clients do before encrypting it
pub fn build_report_archive(debug_info: &str, stack_trace: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (name, content) in [(DEBUG_INFO_ENTRY, debug_info), (STACK_TRACE_ENTRY, stack_trace)] {
            zip.start_file(name, options)
                .map_err(|e| ProtocolError::Archive(e.to_string()))?;
            zip.write_all(content.as_bytes())
                .map_err(|e| ProtocolError::Archive(e.to_string()))?;
        }

        zip.finish()
            .map_err(|e| ProtocolError::Archive(e.to_string()))?;
    }
    Ok(buffer)
}
