pub mod db;

pub use db::{create_db, delete_bill, get_bill_by_id, get_bills, insert_bill, DbPool, SqliteStore};
