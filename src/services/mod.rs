pub mod database;
pub mod storage_service;
pub mod upload_service;
