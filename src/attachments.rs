use crate::importer::{MessageAttachment, MessageSource};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Turns a rich-link attachment index into a file on disk.
pub struct AttachmentResolver {
    /// Usually `~/Library/Messages`.
    root: PathBuf,
    home: Option<PathBuf>,
}

impl AttachmentResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            home: dirs::home_dir(),
        }
    }

    /// Attachments of a message, in the order rich-link indices refer to. A lookup failure
    /// is logged and treated as "no attachments".
    pub fn resolve(&self, source: &dyn MessageSource, message_id: i64) -> Vec<MessageAttachment> {
        source.attachments(message_id).unwrap_or_else(|e| {
            warn!(message_id, "attachment lookup failed: {e:#}");
            Vec::new()
        })
    }

    /// The file for `attachments[index]`, if the index is in range and a copy exists locally.
    pub fn local_file(&self, attachments: &[MessageAttachment], index: usize) -> Option<PathBuf> {
        let attachment = attachments.get(index)?;
        self.candidates(attachment).into_iter().find(|p| p.is_file())
    }

    fn candidates(&self, attachment: &MessageAttachment) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(3);
        if let Some(filename) = attachment.filename.as_deref().filter(|f| !f.is_empty()) {
            paths.push(self.expand_home(filename));
        }
        if !attachment.guid.is_empty() {
            paths.push(self.root.join("Attachments").join(&attachment.guid));
            paths.push(self.root.join(&attachment.guid));
        }
        paths
    }

    fn expand_home(&self, filename: &str) -> PathBuf {
        match (filename.strip_prefix("~/"), &self.home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => Path::new(filename).to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn attachment(guid: &str, filename: Option<&str>) -> MessageAttachment {
        MessageAttachment {
            id: 1,
            guid: guid.to_string(),
            mime_type: Some("image/jpeg".into()),
            filename: filename.map(str::to_string),
        }
    }

    #[test]
    fn prefers_recorded_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("IMG_0001.jpeg");
        fs::write(&file, b"jpeg").unwrap();
        fs::create_dir_all(tmp.path().join("Attachments")).unwrap();
        fs::write(tmp.path().join("Attachments/G1"), b"other").unwrap();

        let resolver = AttachmentResolver::new(tmp.path());
        let atts = vec![attachment("G1", Some(file.to_str().unwrap()))];
        assert_eq!(resolver.local_file(&atts, 0), Some(file));
    }

    #[test]
    fn falls_back_to_guid_layouts() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("G2"), b"jpeg").unwrap();
        let resolver = AttachmentResolver::new(tmp.path());
        let atts = vec![attachment("G2", Some("/nonexistent/file.jpeg"))];
        assert_eq!(resolver.local_file(&atts, 0), Some(tmp.path().join("G2")));
    }

    #[test]
    fn out_of_range_or_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = AttachmentResolver::new(tmp.path());
        let atts = vec![attachment("missing", None)];
        assert_eq!(resolver.local_file(&atts, 0), None);
        assert_eq!(resolver.local_file(&atts, 5), None);
        assert_eq!(resolver.local_file(&[], 0), None);
    }

    #[test]
    fn expands_tilde() {
        let resolver = AttachmentResolver {
            root: PathBuf::from("/r"),
            home: Some(PathBuf::from("/home/me")),
        };
        assert_eq!(
            resolver.expand_home("~/Library/Messages/Attachments/x.png"),
            PathBuf::from("/home/me/Library/Messages/Attachments/x.png")
        );
        assert_eq!(resolver.expand_home("/abs/x.png"), PathBuf::from("/abs/x.png"));
    }
}
