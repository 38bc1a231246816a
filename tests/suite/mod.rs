mod cluster;
mod descriptor;
mod submission;
mod workers;
