//! Data store modules for Supabase integration

pub mod profiles;
pub mod supabase;

pub use profiles::ProfileStore;
pub use supabase::SupabaseClient;
