#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use registrar_core::test;
pub use registrar_core::{
    concurrency,
    concurrency::VersionConflict,
    domain,
    domain::{
        InvariantViolation, LookupCodeSet, StudentAdded, StudentEnrolled, StudentEvent,
        StudentFields, StudentStatus, StudentStatusSet, StudentUnenrolled, StudentUpdated,
    },
    event,
    event::{Envelope, EventDecodeError, EventKind, StudentId},
    registry,
    registry::EventRegistry,
    repository,
    repository::{CommandError, Repository},
    student,
    student::{ApplyError, IssueError, Lifecycle, Student},
    subscription,
    subscription::{ProjectionWorker, SubscriptionHandle},
};

pub mod store {

    pub use registrar_core::store::{
        AppendError, EventStore, EventStream, SubscribableStore, check_append,
    };

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use registrar_postgres::{Error, Store};
    }

    pub use registrar_core::store::inmemory;
}

pub mod snapshot {

    pub use registrar_core::snapshot::{
        NoSnapshots, OfferSnapshotError, Snapshot, SnapshotError, SnapshotOffer, SnapshotPolicy,
        SnapshotStore,
    };

    pub use registrar_core::snapshot::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use registrar_postgres::snapshot::Store;
    }
}

pub mod projection {

    pub use registrar_core::projection::{
        Notification, ProjectionError, ProjectionRouter, ReadStore, Routed, StudentRow,
        StudentSource,
    };

    pub use registrar_core::projection::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use registrar_postgres::projection::{Error, Store};
    }
}
