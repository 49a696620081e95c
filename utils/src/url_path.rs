use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("url cannot be used as a base: {0}")]
pub struct CannotBeABase(pub String);

/// Append path segments to `base`, percent-encoding each one.
///
/// Segments may themselves contain `/`; they are split so that
/// `"shops/42"` becomes two segments instead of one encoded `%2F`.
pub fn with_segments<'a, I>(base: &Url, segments: I) -> Result<Url, CannotBeABase>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| CannotBeABase(base.to_string()))?;
        path.pop_if_empty();
        for segment in segments {
            for part in segment.split('/').filter(|part| !part.is_empty()) {
                path.push(part);
            }
        }
    }
    Ok(url)
}
