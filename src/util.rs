use super::*;

/// Read a NUL-padded fixed-width string field
pub(crate) async fn read_fixed_string<T: AsyncReadExt + Unpin>(
    socket: &mut T,
    len: usize,
) -> Result<String> {
    let mut raw = vec![0u8; len];
    socket.read_exact(&mut raw).await?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Encode a string into a NUL-padded fixed-width field
pub(crate) fn fixed_string(s: &str, len: usize) -> Vec<u8> {
    let mut field = s.as_bytes().to_vec();
    debug_assert!(field.len() <= len);
    field.resize(len, 0);
    field
}
