pub mod pipeline_bench;
pub mod tag_list_bench;
