pub(crate) mod header;
pub(crate) mod huge;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod mapper;
pub(crate) mod select;
pub(crate) mod stats;
pub(crate) mod vm;
