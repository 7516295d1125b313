use crate::config::MigrationConfig;

use super::transformer::{MediaContext, MediaType};

/// Builds the URLs and storage prefixes the migration writes into activity
/// text and the file tree. Every link ends with a slash so that substring
/// rewrites never match the head of a longer id (`/12/` vs `/123/`).
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    site_url: String,
    upload_url: String,
    target_root: String,
    media_slug: String,
    members_slug: String,
    groups_slug: String,
}

pub fn trailing_slash(value: &str) -> String {
    format!("{}/", value.trim_end_matches('/'))
}

impl LinkBuilder {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            site_url: trailing_slash(&config.site_url),
            upload_url: trailing_slash(&config.upload_url),
            target_root: config.target_root.trim_matches('/').to_string(),
            media_slug: config.media_slug.trim_matches('/').to_string(),
            members_slug: config.members_slug.trim_matches('/').to_string(),
            groups_slug: config.groups_slug.trim_matches('/').to_string(),
        }
    }

    pub fn user_link(&self, user_id: i64) -> String {
        format!("{}{}/{}/", self.site_url, self.members_slug, user_id)
    }

    pub fn group_link(&self, group_id: i64) -> String {
        format!("{}{}/{}/", self.site_url, self.groups_slug, group_id)
    }

    pub fn owner_link(&self, context: MediaContext, context_id: i64) -> String {
        match context {
            MediaContext::Profile => self.user_link(context_id),
            MediaContext::Group => self.group_link(context_id),
        }
    }

    /// `<owner link><media slug>/<new id>/`
    pub fn media_permalink(&self, context: MediaContext, context_id: i64, new_id: i64) -> String {
        format!(
            "{}{}/{}/",
            self.owner_link(context, context_id),
            self.media_slug,
            new_id
        )
    }

    /// Permalink the legacy plugin used for a single item, e.g.
    /// `<owner link>photos/<legacy id>/`.
    pub fn legacy_permalink(
        &self,
        context: MediaContext,
        context_id: i64,
        media_type: MediaType,
        legacy_id: i64,
    ) -> String {
        format!(
            "{}{}/{}/",
            self.owner_link(context, context_id),
            media_type.legacy_slug(),
            legacy_id
        )
    }

    pub fn legacy_group_album_link(&self, group_id: i64, album_id: i64) -> String {
        format!("{}albums/{}/", self.group_link(group_id), album_id)
    }

    pub fn upload_url(&self, relative: &str) -> String {
        format!("{}{}", self.upload_url, relative.trim_start_matches('/'))
    }

    pub fn target_root(&self) -> &str {
        &self.target_root
    }

    /// Storage prefix under the target root: `users/<id>` or `groups/<id>`.
    pub fn storage_prefix(&self, context: MediaContext, context_id: i64) -> String {
        match context {
            MediaContext::Profile => format!("users/{context_id}"),
            MediaContext::Group => format!("groups/{context_id}"),
        }
    }

    /// Relative path of a migrated file: `<target root>/<prefix>/<original relative path>`.
    pub fn target_relative(&self, prefix: &str, relative: &str) -> String {
        format!(
            "{}/{}/{}",
            self.target_root,
            prefix.trim_matches('/'),
            relative.trim_start_matches('/')
        )
    }

    pub fn is_migrated_path(&self, relative: &str) -> bool {
        relative
            .trim_start_matches('/')
            .starts_with(&format!("{}/", self.target_root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> LinkBuilder {
        LinkBuilder::new(&MigrationConfig {
            site_url: "https://example.org".into(),
            upload_url: "https://example.org/uploads".into(),
            ..MigrationConfig::default()
        })
    }

    #[test]
    fn owner_links_end_with_slash() {
        let links = builder();
        assert_eq!(links.user_link(7), "https://example.org/members/7/");
        assert_eq!(links.group_link(3), "https://example.org/groups/3/");
        assert_eq!(
            links.media_permalink(MediaContext::Group, 3, 40),
            "https://example.org/groups/3/media/40/"
        );
    }

    #[test]
    fn legacy_permalink_uses_type_slug() {
        let links = builder();
        assert_eq!(
            links.legacy_permalink(MediaContext::Profile, 7, MediaType::Photo, 12),
            "https://example.org/members/7/photos/12/"
        );
        assert_eq!(
            links.legacy_group_album_link(3, 9),
            "https://example.org/groups/3/albums/9/"
        );
    }

    #[test]
    fn target_paths_are_namespaced() {
        let links = builder();
        let prefix = links.storage_prefix(MediaContext::Profile, 7);
        let target = links.target_relative(&prefix, "2013/04/pic.jpg");
        assert_eq!(target, "rtMedia/users/7/2013/04/pic.jpg");
        assert!(links.is_migrated_path(&target));
        assert!(!links.is_migrated_path("2013/04/pic.jpg"));
        assert_eq!(
            links.upload_url(&target),
            "https://example.org/uploads/rtMedia/users/7/2013/04/pic.jpg"
        );
    }
}
