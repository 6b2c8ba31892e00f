//! Verb Classification
//!
//! How safe each well-known verb is to send twice. The client consults this
//! before resending a request after a connection reset.

/// Side-effect class of a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerbClass {
    /// No side effects.
    Read,
    /// Repeating it has the same effect as doing it once.
    Idempotent,
    /// Idempotent except for locking and similar bookkeeping.
    SemiIdempotent,
    /// A filesystem-level (VFS) operation that is mostly idempotent.
    SemiVfs,
    /// Changes state on every call.
    Mutating,
    /// Consumes a streamed body.
    Stream,
}

impl VerbClass {
    /// Whether a request with this verb may be sent again after a reset.
    pub fn is_resendable(self) -> bool {
        matches!(
            self,
            VerbClass::Read | VerbClass::Idempotent | VerbClass::SemiIdempotent
        )
    }
}

use VerbClass::{
    Idempotent as Idem, Mutating as Mutate, Read, SemiIdempotent as Semi, SemiVfs, Stream,
};

static VERB_CLASSES: &[(&[u8], VerbClass)] = &[
    (b"append", Mutate),
    (b"Branch.break_lock", Idem),
    (b"Branch.get_config_file", Read),
    (b"Branch.get_parent", Read),
    (b"Branch.put_config_file", Idem),
    (b"Branch.get_tags_bytes", Read),
    (b"Branch.set_tags_bytes", Idem),
    (b"Branch.heads_to_fetch", Read),
    (b"Branch.get_stacked_on_url", Read),
    (b"Branch.get_physical_lock_status", Read),
    (b"Branch.last_revision_info", Read),
    (b"Branch.lock_write", Semi),
    (b"Branch.revision_history", Read),
    (b"Branch.set_config_option", Idem),
    (b"Branch.set_config_option_dict", Idem),
    (b"Branch.set_last_revision", Idem),
    (b"Branch.set_last_revision_info", Idem),
    (b"Branch.set_last_revision_ex", Idem),
    (b"Branch.set_parent_location", Idem),
    (b"Branch.unlock", Semi),
    (b"Branch.revision_id_to_revno", Read),
    (b"Branch.get_all_reference_info", Read),
    (b"BzrDir.checkout_metadir", Read),
    (b"BzrDir.cloning_metadir", Read),
    (b"BzrDir.create_branch", Semi),
    (b"BzrDir.create_repository", Semi),
    (b"BzrDir.find_repository", Read),
    (b"BzrDir.find_repositoryV2", Read),
    (b"BzrDir.find_repositoryV3", Read),
    (b"BzrDir.get_branches", Read),
    (b"BzrDir.get_config_file", Read),
    (b"BzrDir.destroy_branch", Semi),
    (b"BzrDir.destroy_repository", Semi),
    (b"BzrDir.has_workingtree", Read),
    (b"BzrDirFormat.initialize", Semi),
    (b"BzrDirFormat.initialize_ex_1.16", Semi),
    (b"BzrDir.open", Read),
    (b"BzrDir.open_2.1", Read),
    (b"BzrDir.open_branch", Read),
    (b"BzrDir.open_branchV2", Read),
    (b"BzrDir.open_branchV3", Read),
    (b"delete", SemiVfs),
    (b"get", Read),
    (b"get_bundle", Read),
    (b"has", Read),
    (b"hello", Read),
    (b"iter_files_recursive", Read),
    (b"list_dir", Read),
    (b"mkdir", SemiVfs),
    (b"move", SemiVfs),
    (b"put", Idem),
    (b"put_non_atomic", Idem),
    (b"readv", Read),
    (b"rename", SemiVfs),
    (b"Repository.add_signature_text", Idem),
    (b"Repository.annotate_file_revision", Read),
    (b"Repository.all_revision_ids", Read),
    (b"PackRepository.autopack", Idem),
    (b"Repository.break_lock", Idem),
    (b"Repository.gather_stats", Read),
    (b"Repository.get_parent_map", Read),
    (b"Repository.get_revision_graph", Read),
    (b"Repository.get_revision_signature_text", Read),
    (b"Repository.has_revision", Read),
    (b"Repository.has_signature_for_revision_id", Read),
    (b"Repository.insert_stream", Stream),
    (b"Repository.insert_stream_1.19", Stream),
    (b"Repository.insert_stream_locked", Stream),
    (b"Repository.is_shared", Read),
    (b"Repository.iter_files_bytes", Read),
    (b"Repository.lock_write", Semi),
    (b"Repository.make_working_trees", Read),
    (b"Repository.set_make_working_trees", Idem),
    (b"Repository.unlock", Semi),
    (b"Repository.get_physical_lock_status", Read),
    (b"Repository.get_rev_id_for_revno", Read),
    (b"Repository.get_stream", Read),
    (b"Repository.get_stream_1.19", Read),
    (b"Repository.get_stream_for_missing_keys", Read),
    (b"Repository.iter_revisions", Read),
    (b"Repository.pack", Idem),
    (b"Repository.start_write_group", Semi),
    (b"Repository.commit_write_group", Semi),
    (b"Repository.abort_write_group", Semi),
    (b"Repository.check_write_group", Read),
    (b"Repository.reconcile", Idem),
    (b"Repository.revision_archive", Read),
    (b"Repository.tarball", Read),
    (b"VersionedFileRepository.get_serializer_format", Read),
    (b"VersionedFileRepository.get_inventories", Read),
    (b"rmdir", SemiVfs),
    (b"stat", Read),
    (b"Transport.is_readonly", Read),
];

/// Look up a verb's class. Unknown verbs return `None`.
pub fn classify(verb: &[u8]) -> Option<VerbClass> {
    VERB_CLASSES
        .iter()
        .find(|(name, _)| *name == verb)
        .map(|(_, class)| *class)
}
