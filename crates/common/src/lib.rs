// picsync-common: wire types shared by the picture editing relay and its clients

pub mod protocol;
pub mod types;
