mod client;

pub use client::{
    ApiErrorClass, ChangeRecord, ChangesPage, ContainerInfo, EntryPage, NimbusClient, NimbusError,
    OperationStatus, TransferLink, VersionEntry,
};
