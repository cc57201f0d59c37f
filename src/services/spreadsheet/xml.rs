//! Small helpers shared by the workbook reader and writer.

use std::io::Read;

use anyhow::{Context, Result};
use quick_xml::events::BytesStart;
use zip::ZipArchive;
use zip::result::ZipError;

/// Namespace prefix of an element name including the colon, e.g. `"x:"`.
pub fn prefix_of(e: &BytesStart<'_>) -> String {
    let name = e.name().into_inner();
    match name.iter().rposition(|b| *b == b':') {
        Some(i) => String::from_utf8_lossy(&name[..=i]).into_owned(),
        None => String::new(),
    }
}

/// Unescaped value of the attribute whose qualified name is `key`.
pub fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| unescape(&String::from_utf8_lossy(&a.value)))
}

/// Like [`attr`] but matches on the local part, ignoring any namespace prefix.
pub fn attr_local(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .map(|a| unescape(&String::from_utf8_lossy(&a.value)))
}

/// Resolves the predefined XML entities and numeric character references.
pub fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find(';') {
            Some(end) => {
                let entity = &tail[1..end];
                match resolve_entity(entity) {
                    Some(c) => out.push(c),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// `amp` -> '&', `#65` -> 'A', `#x41` -> 'A'
pub fn resolve_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = entity.strip_prefix('#')?;
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}

/// Reads a UTF-8 archive member; `Ok(None)` when the member does not exist.
pub fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot open {} in workbook", name)),
    };
    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("cannot read {} in workbook", name))?;
    Ok(Some(content))
}
