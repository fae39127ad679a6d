pub mod helpers;
mod tests_corruption;
mod tests_coverage;
mod tests_edge_cases;
mod tests_rotation;
mod tests_rotation_edge;
mod tests_truncation;
