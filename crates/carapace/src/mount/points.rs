//! The mount point registry.
//!
//! Every `add_*` call validates its input immediately, so an invalid mount
//! never reaches the final list handed to the mount executor.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use carapace_common::{CarapaceError, CarapaceResult};
use serde::{Deserialize, Serialize};

use super::flags::MountFlags;
use super::tag::Tag;
use super::{MountPlan, MountPoint, PlannedMount};

const OFFSET_OPT: &str = "offset=";
const SIZELIMIT_OPT: &str = "sizelimit=";
const LOWERDIR_OPT: &str = "lowerdir=";
const UPPERDIR_OPT: &str = "upperdir=";
const WORKDIR_OPT: &str = "workdir=";
const CONTEXT_OPT: &str = "context=";

/// Options synthesized for image mounts, dropped again on import.
const IMAGE_SYNTHESIZED: &[&str] = &["loop", "errors=remount-ro"];

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Validation rules applied by [`Points`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountPolicy {
    /// Security context appended as a `context=` option.
    pub security_context: Option<String>,
    /// Filesystem types that never receive a `context=` option.
    pub context_exempt_fs: BTreeSet<String>,
    /// Filesystem types allowed for image mounts.
    pub image_fs_types: BTreeSet<String>,
    /// Filesystem types allowed for kernel mounts.
    pub kernel_fs_types: BTreeSet<String>,
}

impl Default for MountPolicy {
    fn default() -> Self {
        Self {
            security_context: None,
            context_exempt_fs: set(&["tmpfs", "ramfs", "mqueue"]),
            image_fs_types: set(&["ext3", "squashfs", "encryptfs"]),
            kernel_fs_types: set(&[
                "proc", "sysfs", "tmpfs", "overlay", "devpts", "mqueue", "ramfs",
            ]),
        }
    }
}

/// Ordered mount point list with a tag index.
#[derive(Debug, Clone, Default)]
pub struct Points {
    points: Vec<MountPoint>,
    tags: BTreeMap<Tag, Vec<String>>,
    policy: MountPolicy,
}

fn require_absolute(what: &str, path: &str) -> CarapaceResult<()> {
    if path.is_empty() {
        return Err(CarapaceError::mount(format!("{what} is empty")));
    }
    if !Path::new(path).is_absolute() {
        return Err(CarapaceError::mount(format!(
            "{what} {path} must be an absolute path"
        )));
    }
    Ok(())
}

fn reject_bind_like(kind: &str, flags: MountFlags) -> CarapaceResult<()> {
    if flags.intersects(MountFlags::BIND_LIKE) {
        return Err(CarapaceError::mount(format!(
            "{kind} mounts can't carry bind, remount or recursive flags"
        )));
    }
    Ok(())
}

fn option_value<'a>(options: &'a [String], prefix: &str) -> Option<&'a str> {
    options.iter().find_map(|o| o.strip_prefix(prefix))
}

impl Points {
    /// Empty registry with default rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry with the given rules.
    #[must_use]
    pub fn with_policy(policy: MountPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Validation rules in use.
    #[must_use]
    pub const fn policy(&self) -> &MountPolicy {
        &self.policy
    }

    /// Number of mount points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether there are no mount points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn add(
        &mut self,
        source: &str,
        dest: &str,
        fs_type: &str,
        flags: MountFlags,
        extra: &[String],
    ) -> CarapaceResult<()> {
        require_absolute("mount destination", dest)?;
        if flags.contains(MountFlags::REC)
            && !flags.intersects(MountFlags::BIND | MountFlags::PROPAGATION)
        {
            return Err(CarapaceError::mount(format!(
                "recursive flag on {dest} needs a bind or propagation change"
            )));
        }
        if !flags.contains(MountFlags::REMOUNT) && self.points.iter().any(|p| p.destination == dest)
        {
            return Err(CarapaceError::mount(format!(
                "destination {dest} is already registered"
            )));
        }

        let mut options = flags.to_options();
        options.extend(extra.iter().filter(|o| !o.is_empty()).cloned());

        let has_context = options.iter().any(|o| o.starts_with(CONTEXT_OPT));
        if let Some(ctx) = &self.policy.security_context {
            if !has_context && !self.policy.context_exempt_fs.contains(fs_type) {
                options.push(format!("{CONTEXT_OPT}\"{ctx}\""));
            }
        }

        tracing::debug!(source, dest, fs_type, ?options, "Registered mount point");
        self.points.push(MountPoint {
            source: source.to_string(),
            destination: dest.to_string(),
            fs_type: fs_type.to_string(),
            options,
        });
        Ok(())
    }

    /// Register a bind mount of `source` on `dest`.
    pub fn add_bind(&mut self, source: &str, dest: &str, flags: MountFlags) -> CarapaceResult<()> {
        self.add_bind_with(source, dest, flags, &[])
    }

    fn add_bind_with(
        &mut self,
        source: &str,
        dest: &str,
        flags: MountFlags,
        extra: &[String],
    ) -> CarapaceResult<()> {
        require_absolute("bind source", source)?;
        self.add(source, dest, "", flags | MountFlags::BIND, extra)
    }

    /// Register a loop mount of the filesystem at `offset` in the image file
    /// `source`, limited to `sizelimit` bytes.
    pub fn add_image(
        &mut self,
        source: &str,
        dest: &str,
        fs_type: &str,
        flags: MountFlags,
        offset: u64,
        sizelimit: u64,
    ) -> CarapaceResult<()> {
        self.add_image_with(source, dest, fs_type, flags, offset, sizelimit, &[])
    }

    #[allow(clippy::too_many_arguments)]
    fn add_image_with(
        &mut self,
        source: &str,
        dest: &str,
        fs_type: &str,
        flags: MountFlags,
        offset: u64,
        sizelimit: u64,
        extra: &[String],
    ) -> CarapaceResult<()> {
        require_absolute("image source", source)?;
        reject_bind_like("image", flags)?;
        if !self.policy.image_fs_types.contains(fs_type) {
            return Err(CarapaceError::mount(format!(
                "filesystem type {fs_type} is not authorized for image mounts"
            )));
        }
        if sizelimit == 0 {
            return Err(CarapaceError::mount("image mount size limit can't be zero"));
        }

        let mut options = vec![
            "loop".to_string(),
            format!("{OFFSET_OPT}{offset}"),
            format!("{SIZELIMIT_OPT}{sizelimit}"),
            "errors=remount-ro".to_string(),
        ];
        options.extend_from_slice(extra);
        self.add(source, dest, fs_type, flags, &options)
    }

    /// Register an overlay mount. `upper` requires `work`.
    pub fn add_overlay(
        &mut self,
        dest: &str,
        flags: MountFlags,
        lower: &str,
        upper: Option<&str>,
        work: Option<&str>,
    ) -> CarapaceResult<()> {
        self.add_overlay_with(dest, flags, lower, upper, work, &[])
    }

    fn add_overlay_with(
        &mut self,
        dest: &str,
        flags: MountFlags,
        lower: &str,
        upper: Option<&str>,
        work: Option<&str>,
        extra: &[String],
    ) -> CarapaceResult<()> {
        reject_bind_like("overlay", flags)?;
        if lower.is_empty() {
            return Err(CarapaceError::mount("overlay lowerdir is required"));
        }
        for dir in lower.split(':') {
            require_absolute("overlay lowerdir", dir)?;
        }

        let upper = upper.filter(|u| !u.is_empty());
        let work = work.filter(|w| !w.is_empty());
        let mut options = vec![format!("{LOWERDIR_OPT}{lower}")];
        match (upper, work) {
            (Some(upper), Some(work)) => {
                require_absolute("overlay upperdir", upper)?;
                require_absolute("overlay workdir", work)?;
                options.push(format!("{UPPERDIR_OPT}{upper}"));
                options.push(format!("{WORKDIR_OPT}{work}"));
            }
            (Some(_), None) => {
                return Err(CarapaceError::mount("overlay upperdir requires a workdir"));
            }
            (None, _) => {}
        }
        options.extend_from_slice(extra);
        self.add("overlay", dest, "overlay", flags, &options)
    }

    /// Register a kernel filesystem mount.
    pub fn add_fs(
        &mut self,
        dest: &str,
        fs_type: &str,
        flags: MountFlags,
        options: &[String],
    ) -> CarapaceResult<()> {
        reject_bind_like("filesystem", flags)?;
        if !self.policy.kernel_fs_types.contains(fs_type) {
            return Err(CarapaceError::mount(format!(
                "filesystem type {fs_type} is not authorized"
            )));
        }
        self.add(fs_type, dest, fs_type, flags, options)
    }

    /// Register a remount of `dest` with new flags.
    pub fn add_remount(&mut self, dest: &str, flags: MountFlags) -> CarapaceResult<()> {
        self.add("", dest, "", flags | MountFlags::REMOUNT, &[])
    }

    /// Associate a registered destination with a tag.
    pub fn tag(&mut self, dest: &str, tag: Tag) -> CarapaceResult<()> {
        if !self.points.iter().any(|p| p.destination == dest) {
            return Err(CarapaceError::mount(format!(
                "destination {dest} is not registered"
            )));
        }
        if let Some((other, _)) = self
            .tags
            .iter()
            .find(|(t, dests)| **t != tag && dests.iter().any(|d| d == dest))
        {
            return Err(CarapaceError::mount(format!(
                "destination {dest} is already tagged {other}"
            )));
        }

        let dests = self.tags.entry(tag).or_default();
        if dests.iter().any(|d| d == dest) {
            return Ok(());
        }
        if !tag.is_multi() && !dests.is_empty() {
            return Err(CarapaceError::mount(format!(
                "tag {tag} allows a single destination, {} already registered",
                dests[0]
            )));
        }
        dests.push(dest.to_string());
        Ok(())
    }

    /// Associate a registered destination with a tag given by name.
    pub fn tag_by_name(&mut self, dest: &str, tag: &str) -> CarapaceResult<()> {
        let tag = tag
            .parse::<Tag>()
            .map_err(|e| CarapaceError::mount(e.to_string()))?;
        self.tag(dest, tag)
    }

    /// Tags associated with a destination.
    #[must_use]
    pub fn tags_of(&self, dest: &str) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|(_, dests)| dests.iter().any(|d| d == dest))
            .map(|(t, _)| *t)
            .collect()
    }

    /// Every mount point in registration order.
    #[must_use]
    pub fn get_all(&self) -> &[MountPoint] {
        &self.points
    }

    /// Mount points whose destination carries `tag`, in registration order.
    #[must_use]
    pub fn get_by_tag(&self, tag: Tag) -> Vec<&MountPoint> {
        let Some(dests) = self.tags.get(&tag) else {
            return Vec::new();
        };
        self.points
            .iter()
            .filter(|p| dests.contains(&p.destination))
            .collect()
    }

    /// Mount points mounted on `dest`.
    #[must_use]
    pub fn get_by_dest(&self, dest: &str) -> Vec<&MountPoint> {
        self.points.iter().filter(|p| p.destination == dest).collect()
    }

    /// Mount points mounted from `source`.
    #[must_use]
    pub fn get_by_source(&self, source: &str) -> Vec<&MountPoint> {
        self.points.iter().filter(|p| p.source == source).collect()
    }

    /// Tagged mount points grouped by tag in assembly order, followed by
    /// untagged ones in registration order.
    #[must_use]
    pub fn get_all_by_tag_order(&self) -> Vec<PlannedMount> {
        let mut out: Vec<PlannedMount> = Tag::ALL
            .into_iter()
            .flat_map(|tag| {
                self.get_by_tag(tag).into_iter().map(move |p| PlannedMount {
                    tag: Some(tag),
                    point: p.clone(),
                })
            })
            .collect();
        out.extend(
            self.points
                .iter()
                .filter(|p| self.tags_of(&p.destination).is_empty())
                .map(|p| PlannedMount {
                    tag: None,
                    point: p.clone(),
                }),
        );
        out
    }

    /// The ordered hand-off value for the mount executor.
    #[must_use]
    pub fn plan(&self) -> MountPlan {
        MountPlan {
            mounts: self.get_all_by_tag_order(),
        }
    }

    fn forget_dest(&mut self, dest: &str) {
        for dests in self.tags.values_mut() {
            dests.retain(|d| d != dest);
        }
        self.tags.retain(|_, dests| !dests.is_empty());
    }

    /// Remove every mount point carrying `tag`.
    pub fn remove_by_tag(&mut self, tag: Tag) {
        if let Some(dests) = self.tags.remove(&tag) {
            self.points.retain(|p| !dests.contains(&p.destination));
        }
    }

    /// Remove every mount point on `dest`.
    pub fn remove_by_dest(&mut self, dest: &str) {
        self.points.retain(|p| p.destination != dest);
        self.forget_dest(dest);
    }

    /// Remove every mount point from `source`.
    pub fn remove_by_source(&mut self, source: &str) {
        let removed: Vec<String> = self
            .points
            .iter()
            .filter(|p| p.source == source)
            .map(|p| p.destination.clone())
            .collect();
        self.points.retain(|p| p.source != source);
        for dest in removed {
            if !self.points.iter().any(|p| p.destination == dest) {
                self.forget_dest(&dest);
            }
        }
    }

    /// Remove everything.
    pub fn remove_all(&mut self) {
        self.points.clear();
        self.tags.clear();
    }

    /// Register a list of mount points. Either every point is accepted or
    /// the registry is emptied and the first failure is returned.
    pub fn import(&mut self, mounts: &[MountPoint]) -> CarapaceResult<()> {
        self.import_all(mounts.iter().map(|p| (None, p)))
    }

    /// Register a plan, restoring its tags. Same guarantee as
    /// [`Points::import`].
    pub fn import_plan(&mut self, plan: &MountPlan) -> CarapaceResult<()> {
        self.import_all(plan.mounts.iter().map(|m| (m.tag, &m.point)))
    }

    fn import_all<'a>(
        &mut self,
        mounts: impl IntoIterator<Item = (Option<Tag>, &'a MountPoint)>,
    ) -> CarapaceResult<()> {
        for (tag, point) in mounts {
            let result = self.import_one(point).and_then(|()| match tag {
                Some(tag) => self.tag(&point.destination, tag),
                None => Ok(()),
            });
            if let Err(e) = result {
                tracing::debug!(dest = %point.destination, error = %e, "Import failed, rolling back");
                self.remove_all();
                return Err(e);
            }
        }
        Ok(())
    }

    fn import_one(&mut self, point: &MountPoint) -> CarapaceResult<()> {
        let (flags, data) = MountFlags::parse_options(&point.options);
        let dest = point.destination.as_str();

        if flags.contains(MountFlags::REMOUNT) {
            return self.add_remount(dest, flags);
        }
        if flags.contains(MountFlags::BIND) {
            return self.add_bind_with(&point.source, dest, flags, &data);
        }

        if self.policy.image_fs_types.contains(&point.fs_type) {
            let parse = |prefix: &str| -> CarapaceResult<u64> {
                option_value(&data, prefix)
                    .ok_or_else(|| CarapaceError::mount(format!("image mount on {dest} lacks {prefix}")))?
                    .parse()
                    .map_err(|e| CarapaceError::mount(format!("bad {prefix} for {dest}: {e}")))
            };
            let offset = parse(OFFSET_OPT)?;
            let sizelimit = parse(SIZELIMIT_OPT)?;
            let extra: Vec<String> = data
                .iter()
                .filter(|o| {
                    !o.starts_with(OFFSET_OPT)
                        && !o.starts_with(SIZELIMIT_OPT)
                        && !IMAGE_SYNTHESIZED.contains(&o.as_str())
                })
                .cloned()
                .collect();
            return self.add_image_with(
                &point.source,
                dest,
                &point.fs_type,
                flags,
                offset,
                sizelimit,
                &extra,
            );
        }

        if let Some(lower) = option_value(&data, LOWERDIR_OPT) {
            let upper = option_value(&data, UPPERDIR_OPT);
            let work = option_value(&data, WORKDIR_OPT);
            let extra: Vec<String> = data
                .iter()
                .filter(|o| {
                    !o.starts_with(LOWERDIR_OPT)
                        && !o.starts_with(UPPERDIR_OPT)
                        && !o.starts_with(WORKDIR_OPT)
                })
                .cloned()
                .collect();
            return self.add_overlay_with(dest, flags, lower, upper, work, &extra);
        }

        self.add_fs(dest, &point.fs_type, flags, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(p: &MountPoint) -> String {
        p.options.join(",")
    }

    #[test]
    fn destination_must_be_absolute() {
        let mut points = Points::new();
        assert!(points.add_bind("/src", "", MountFlags::empty()).is_err());
        assert!(points.add_bind("/src", "relative", MountFlags::empty()).is_err());
        assert!(points.add_bind("src", "/dst", MountFlags::empty()).is_err());
    }

    #[test]
    fn duplicate_destination_needs_remount() {
        let mut points = Points::new();
        points.add_bind("/src", "/dst", MountFlags::REC).unwrap();
        assert!(points.add_bind("/other", "/dst", MountFlags::empty()).is_err());
        points.add_remount("/dst", MountFlags::RDONLY).unwrap();

        let all = points.get_by_dest("/dst");
        assert_eq!(all.len(), 2);
        assert_eq!(opts(all[0]), "rbind");
        assert_eq!(opts(all[1]), "remount,ro");
    }

    #[test]
    fn overlay_without_upper_is_lowerdir_only() {
        let mut points = Points::new();
        points
            .add_overlay("/mnt", MountFlags::empty(), "/lower", None, None)
            .unwrap();
        assert_eq!(points.get_all()[0].options, ["lowerdir=/lower"]);
    }

    #[test]
    fn overlay_upper_requires_workdir() {
        let mut points = Points::new();
        let err = points
            .add_overlay("/mnt", MountFlags::empty(), "/lower", Some("/upper"), None)
            .unwrap_err();
        assert!(err.to_string().contains("workdir"));
        assert!(
            points
                .add_overlay("/mnt", MountFlags::BIND, "/lower", None, None)
                .is_err()
        );
    }

    #[test]
    fn empty_upperdir_is_read_only_overlay() {
        let mut points = Points::new();
        points
            .add_overlay("/mnt", MountFlags::empty(), "/lower", Some(""), Some(""))
            .unwrap();
        assert_eq!(points.get_all()[0].options, ["lowerdir=/lower"]);

        let mut imported = Points::new();
        imported
            .import(&[MountPoint {
                source: "overlay".into(),
                destination: "/final".into(),
                fs_type: "overlay".into(),
                options: vec!["lowerdir=/lower".into(), "upperdir=".into(), "workdir=".into()],
            }])
            .unwrap();
        assert_eq!(imported.get_all()[0].options, ["lowerdir=/lower"]);
    }

    #[test]
    fn recursive_flag_needs_bind_or_propagation() {
        let mut points = Points::new();
        let err = points
            .add_remount("/dst", MountFlags::RDONLY | MountFlags::REC)
            .unwrap_err();
        assert!(err.to_string().contains("recursive"));
        assert!(points.add_fs("/tmp", "tmpfs", MountFlags::REC, &[]).is_err());
        assert!(points.is_empty());

        points.add_bind("/src", "/dst", MountFlags::REC).unwrap();
        points
            .add_remount("/dst", MountFlags::BIND | MountFlags::REC | MountFlags::RDONLY)
            .unwrap();
        points
            .add_remount("/dst", MountFlags::REC | MountFlags::PRIVATE)
            .unwrap();
        assert_eq!(points.get_by_dest("/dst").len(), 3);
    }

    #[test]
    fn image_options_are_synthesized() {
        let mut points = Points::new();
        points
            .add_image("/images/a.img", "/rootfs", "ext3", MountFlags::NOSUID, 31, 10)
            .unwrap();
        insta::assert_snapshot!(
            opts(&points.get_all()[0]),
            @"nosuid,loop,offset=31,sizelimit=10,errors=remount-ro"
        );
    }

    #[test]
    fn image_rules() {
        let mut points = Points::new();
        let zero = points.add_image("/a.img", "/r", "ext3", MountFlags::empty(), 0, 0);
        assert!(zero.is_err());
        let bind = points.add_image("/a.img", "/r", "ext3", MountFlags::BIND, 0, 10);
        assert!(bind.is_err());
        let xfs = points.add_image("/a.img", "/r", "xfs", MountFlags::empty(), 0, 10);
        assert!(xfs.is_err());
        let relative = points.add_image("a.img", "/r", "ext3", MountFlags::empty(), 0, 10);
        assert!(relative.is_err());
        assert!(points.is_empty());
    }

    #[test]
    fn fs_types_are_checked() {
        let mut points = Points::new();
        points
            .add_fs("/proc", "proc", MountFlags::NOSUID, &[])
            .unwrap();
        assert!(points.add_fs("/x", "nfs", MountFlags::empty(), &[]).is_err());
        assert!(points.add_fs("/y", "tmpfs", MountFlags::REMOUNT, &[]).is_err());
        assert_eq!(points.get_by_source("proc").len(), 1);
    }

    #[test]
    fn context_is_appended_unless_exempt() {
        let mut points = Points::with_policy(MountPolicy {
            security_context: Some("system_u:object_r:container_file_t:s0".into()),
            ..MountPolicy::default()
        });
        points.add_fs("/proc", "proc", MountFlags::empty(), &[]).unwrap();
        points.add_fs("/tmp", "tmpfs", MountFlags::empty(), &[]).unwrap();
        points
            .add_fs("/sys", "sysfs", MountFlags::empty(), &["context=\"x\"".into()])
            .unwrap();

        let all = points.get_all();
        assert_eq!(
            all[0].options,
            ["context=\"system_u:object_r:container_file_t:s0\""]
        );
        assert!(all[1].options.is_empty());
        assert_eq!(all[2].options, ["context=\"x\""]);
    }

    #[test]
    fn tag_rules() {
        let mut points = Points::new();
        points.add_bind("/a", "/a", MountFlags::empty()).unwrap();
        points.add_bind("/b", "/b", MountFlags::empty()).unwrap();

        assert!(points.tag("/missing", Tag::Binds).is_err());
        assert!(points.tag_by_name("/a", "bogus").is_err());

        points.tag("/a", Tag::RootFs).unwrap();
        points.tag("/a", Tag::RootFs).unwrap();
        assert!(points.tag("/b", Tag::RootFs).is_err());
        assert!(points.tag("/a", Tag::Binds).is_err());

        points.tag("/b", Tag::Binds).unwrap();
        assert_eq!(points.tags_of("/b"), [Tag::Binds]);
        assert_eq!(points.get_by_tag(Tag::RootFs)[0].destination, "/a");
    }

    #[test]
    fn removal_keeps_index_consistent() {
        let mut points = Points::new();
        points.add_bind("/a", "/a", MountFlags::empty()).unwrap();
        points.add_bind("/a", "/b", MountFlags::empty()).unwrap();
        points.add_fs("/proc", "proc", MountFlags::empty(), &[]).unwrap();
        points.tag("/a", Tag::Binds).unwrap();
        points.tag("/b", Tag::Binds).unwrap();
        points.tag("/proc", Tag::Kernel).unwrap();

        points.remove_by_dest("/a");
        assert!(points.get_by_dest("/a").is_empty());
        assert!(points.tags_of("/a").is_empty());
        assert_eq!(points.get_by_tag(Tag::Binds).len(), 1);

        points.remove_by_source("/a");
        assert!(points.get_by_tag(Tag::Binds).is_empty());

        points.remove_by_tag(Tag::Kernel);
        assert!(points.is_empty());
    }

    #[test]
    fn import_rolls_back_on_failure() {
        let mut points = Points::new();
        let good = MountPoint {
            source: "/a".into(),
            destination: "/a".into(),
            fs_type: String::new(),
            options: vec!["bind".into()],
        };
        let bad = MountPoint {
            source: "nfs".into(),
            destination: "/n".into(),
            fs_type: "nfs".into(),
            options: Vec::new(),
        };
        assert!(points.import(&[good, bad]).is_err());
        assert!(points.is_empty());
    }

    #[test]
    fn import_dispatches_by_intent() {
        let mut src = Points::new();
        src.add_bind("/host", "/data", MountFlags::REC | MountFlags::NOSUID)
            .unwrap();
        src.add_remount("/data", MountFlags::RDONLY | MountFlags::BIND)
            .unwrap();
        src.add_image("/a.sif", "/rootfs", "squashfs", MountFlags::NODEV, 4096, 8192)
            .unwrap();
        src.add_overlay("/final", MountFlags::NODEV, "/l1:/l2", Some("/u"), Some("/w"))
            .unwrap();
        src.add_fs("/dev/shm", "tmpfs", MountFlags::NOEXEC, &["mode=1777".into()])
            .unwrap();
        src.tag("/rootfs", Tag::RootFs).unwrap();
        src.tag("/data", Tag::UserBinds).unwrap();

        let mut dst = Points::new();
        dst.import(src.get_all()).unwrap();
        assert_eq!(dst.get_all(), src.get_all());

        let mut tagged = Points::new();
        tagged.import_plan(&src.plan()).unwrap();
        assert_eq!(tagged.tags_of("/rootfs"), [Tag::RootFs]);
        assert_eq!(tagged.get_by_tag(Tag::UserBinds).len(), 2);
        assert_eq!(tagged.plan().mounts[0].point.destination, "/rootfs");
    }
}
