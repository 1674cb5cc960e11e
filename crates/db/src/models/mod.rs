pub mod research_task;

#[cfg(test)]
pub(crate) mod test_utils;
